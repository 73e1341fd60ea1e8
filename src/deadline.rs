use std::{future::Future, time::Duration};

use tokio::time::timeout;

use crate::error::BridgeError;

/// A named time budget for one step of a multi-step operation.
///
/// Running a future under a deadline drops (and so cancels) it once the budget
/// is spent, so a hung step never keeps its caller suspended.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    step: &'static str,
    limit: Duration,
}

impl Deadline {
    pub fn new(step: &'static str, limit: Duration) -> Self {
        Self { step, limit }
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub async fn run<F, T>(&self, future: F) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, BridgeError>>,
    {
        match timeout(self.limit, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(step = self.step, limit_ms = self.limit.as_millis() as u64, "step timed out");
                Err(BridgeError::Timeout(self.limit.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_hung_step() {
        let deadline = Deadline::new("token", Duration::from_millis(5_000));
        let result: Result<(), _> = deadline.run(std::future::pending()).await;
        assert_eq!(result, Err(BridgeError::Timeout(5_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn passes_through_step_result() {
        let deadline = Deadline::new("server", Duration::from_secs(1));
        let ok = deadline.run(async { Ok::<_, BridgeError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<(), _> = deadline
            .run(async { Err(BridgeError::UnknownServer) })
            .await;
        assert_eq!(err, Err(BridgeError::UnknownServer));
    }
}
