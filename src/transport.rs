use std::process::Stdio;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectionMode {
    Local,
    Remote { address: String },
}

/// Line-oriented duplex channel to the protocol service.
///
/// `outbound` accepts one JSON document per entry; `inbound` yields one per
/// entry and closes when the peer goes away.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps the transport's I/O tasks alive; shutting down aborts them.
pub struct TransportGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl TransportGuard {
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport {
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
        TransportGuard,
    ) {
        (
            self.outbound,
            self.inbound,
            TransportGuard { tasks: self.tasks },
        )
    }

    /// Spawn the protocol service as a child process speaking JSON lines on stdio.
    pub async fn spawn_local(command: &[String]) -> Result<Self, BridgeError> {
        let (binary, args) = command
            .split_first()
            .ok_or_else(|| BridgeError::InitFailure("empty protocol command".to_string()))?;

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                BridgeError::InitFailure(format!("failed to start {binary}: {error}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::InitFailure("protocol stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::InitFailure("protocol stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::InitFailure("protocol stderr unavailable".to_string()))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(error) = written {
                    tracing::warn!(%error, "protocol stdin write failed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if inbound_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "protocol stdout read error");
                        break;
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "protocol", "{line}");
            }
        });

        // Owns the child so aborting the task kills the process.
        let waiter = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "protocol service exited"),
                Err(error) => tracing::warn!(%error, "failed waiting for protocol service"),
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader, stderr_task, waiter],
        })
    }

    /// Dial a remote protocol service over a websocket.
    pub async fn connect_remote(address: &str) -> Result<Self, BridgeError> {
        let url = normalize_remote_address(address)?;
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|error| BridgeError::InvalidAddress(format!("{address}: {error}")))?;

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| BridgeError::InitFailure(format!("failed to connect {url}: {error}")))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(error) = sink.send(Message::Text(line.into())).await {
                    tracing::warn!(%error, "remote protocol write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "remote protocol read error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }

    /// In-process pair: the returned peer plays the protocol service.
    #[cfg(test)]
    pub(crate) fn memory() -> (Self, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
                tasks: Vec::new(),
            },
            MemoryPeer {
                to_bridge: inbound_tx,
                from_bridge: outbound_rx,
            },
        )
    }
}

#[cfg(test)]
pub(crate) struct MemoryPeer {
    pub to_bridge: mpsc::UnboundedSender<String>,
    pub from_bridge: mpsc::UnboundedReceiver<String>,
}

#[cfg(test)]
impl MemoryPeer {
    pub async fn recv_json(&mut self) -> serde_json::Value {
        let line = self
            .from_bridge
            .recv()
            .await
            .expect("bridge should send a frame");
        serde_json::from_str(&line).expect("bridge frames are json")
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.to_bridge
            .send(value.to_string())
            .expect("bridge should be listening");
    }
}

pub fn normalize_remote_address(address: &str) -> Result<String, BridgeError> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(BridgeError::InvalidAddress(address.to_string()));
    }

    let url = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(BridgeError::InvalidAddress(format!(
            "{address}: only ws:// and wss:// are supported"
        )));
    } else {
        format!("ws://{trimmed}")
    };

    url.as_str()
        .into_client_request()
        .map_err(|error| BridgeError::InvalidAddress(format!("{address}: {error}")))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_host_port() {
        assert_eq!(
            normalize_remote_address("127.0.0.1:9091").as_deref(),
            Ok("ws://127.0.0.1:9091")
        );
        assert_eq!(
            normalize_remote_address("wss://bridge.example.org/rpc").as_deref(),
            Ok("wss://bridge.example.org/rpc")
        );
    }

    #[test]
    fn rejects_bad_addresses() {
        for address in ["", "   ", "http://example.org", "not an address"] {
            assert!(
                matches!(
                    normalize_remote_address(address),
                    Err(BridgeError::InvalidAddress(_))
                ),
                "{address:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn local_spawn_failure_is_init_failure() {
        let result =
            Transport::spawn_local(&["/definitely/not/a/protocol-daemon".to_string()]).await;
        assert!(matches!(result, Err(BridgeError::InitFailure(_))));
    }
}
