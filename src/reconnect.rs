/// Reconnect policy with exponential backoff and jitter, plus a background
/// supervisor that re-opens dropped channels.
use crate::error::{RealtimeError, RealtimeResult};
use crate::multiplexer::{ConnectionStatus, SubscriptionMultiplexer};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry number `retry` (0-based), before jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let millis = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(retry as i32);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        apply_jitter(self.base_delay(retry), self.jitter)
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

/// Run `f` until it succeeds, backing off between attempts.
///
/// Non-retryable errors are returned as-is; running out of retries yields
/// `ReconnectExhausted` carrying the last error.
pub async fn with_backoff<F, Fut, T>(policy: &ReconnectPolicy, mut f: F) -> RealtimeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RealtimeResult<T>>,
{
    let mut retry = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if retry >= policy.max_retries {
                    warn!("Max retries ({}) reached", policy.max_retries);
                    return Err(RealtimeError::ReconnectExhausted {
                        attempts: retry + 1,
                        last_error: e.to_string(),
                    });
                }

                let delay = policy.delay(retry);
                retry += 1;
                warn!(
                    error = %e,
                    "Retry attempt {}/{}, waiting {:?}",
                    retry, policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Background task calling `reconnect` whenever a channel reports disconnected
pub struct ReconnectSupervisor {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    pub fn spawn(multiplexer: SubscriptionMultiplexer, check_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let ConnectionStatus::Disconnected { channels } = multiplexer.connection_status() {
                            warn!(count = channels.len(), "Realtime channels disconnected, reconnecting");
                            match multiplexer.reconnect().await {
                                Ok(reopened) => info!(reopened, "Realtime channels reconnected"),
                                Err(e) => warn!(error = %e, "Reconnect failed, will retry on next check"),
                            }
                        }
                    }
                }
            }

            info!("Reconnect supervisor stopped");
        });

        Self {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(1000),
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1300));
        }
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_backoff(&fast_policy(3), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(RealtimeError::ChannelOpen {
                        channel: "chat_c1".into(),
                        reason: "temporary".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: RealtimeResult<()> = with_backoff(&fast_policy(2), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RealtimeError::ChannelOpen {
                    channel: "chat_c1".into(),
                    reason: "down".into(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RealtimeError::ReconnectExhausted { attempts: 3, .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: RealtimeResult<()> = with_backoff(&fast_policy(5), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(RealtimeError::Config("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(RealtimeError::Config(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
