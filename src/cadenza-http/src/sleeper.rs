use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HttpError;
use crate::util::lock_unpoisoned;

/// Cooperative delay used for cooldowns and retry backoff.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock_unpoisoned(&self.sleeps).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        lock_unpoisoned(&self.sleeps).push(duration);
    }
}

/// Sleeps unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(
    sleeper: &dyn Sleeper,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), HttpError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(HttpError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::Cancelled),
        _ = sleeper.sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sleeper_records_without_waiting() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        sleep_or_cancel(&sleeper, Duration::from_secs(30), &cancel)
            .await
            .expect("sleep");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_real_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = sleep_or_cancel(&TokioSleeper, Duration::from_secs(30), &cancel).await;
        assert!(matches!(result, Err(HttpError::Cancelled)));
    }
}
