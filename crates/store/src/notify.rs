//! Pooled LISTEN/NOTIFY listener
//!
//! One physical listener connection serves the whole process, multiplexed
//! across sessions by channel name. On connection loss the listener
//! reconnects with exponential backoff and re-subscribes every channel
//! still bound; notifications missed during the gap are accepted as lost
//! because the next tick snapshot restores correctness.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use worldsync_config::ReplicationConfig;

use crate::client::Store;
use crate::error::StoreError;

/// One received NOTIFY.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

/// The process-wide listener.
pub struct Listener {
    pool: PgPool,
    inner: PgListener,
    channels: HashSet<String>,
    backoff: Backoff,
}

impl Listener {
    /// Open the physical listener connection.
    pub async fn connect(store: &Store, config: &ReplicationConfig) -> Result<Self, StoreError> {
        let inner = PgListener::connect_with(store.pool()).await?;
        Ok(Self {
            pool: store.pool().clone(),
            inner,
            channels: HashSet::new(),
            backoff: Backoff {
                base: Duration::from_millis(config.listener_backoff_base_ms),
                cap: Duration::from_millis(config.listener_backoff_cap_ms),
                jitter: config.listener_backoff_jitter,
            },
        })
    }

    /// Subscribe a channel; no-op when already bound.
    pub async fn listen(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.channels.insert(channel.to_string()) {
            self.inner.listen(channel).await?;
        }
        Ok(())
    }

    /// Unsubscribe a channel; idempotent.
    pub async fn unlisten(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.channels.remove(channel) {
            self.inner.unlisten(channel).await?;
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Receive the next notification, riding out connection loss.
    ///
    /// Never returns an error to the caller; a broken listener is rebuilt
    /// in place and the wait continues.
    pub async fn recv(&mut self) -> Notification {
        loop {
            match self.inner.recv().await {
                Ok(notification) => {
                    return Notification {
                        channel: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                    };
                }
                Err(error) => {
                    tracing::warn!(%error, "Notification listener lost; reconnecting");
                    self.reconnect().await;
                }
            }
        }
    }

    /// Rebuild the physical connection and re-subscribe every bound channel.
    async fn reconnect(&mut self) {
        let mut delay = self.backoff.base;

        loop {
            tokio::time::sleep(jittered(delay, self.backoff.jitter)).await;

            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => {
                    let channels: Vec<String> = self.channels.iter().cloned().collect();
                    match resubscribe(&mut listener, &channels).await {
                        Ok(()) => {
                            tracing::info!(
                                channels = channels.len(),
                                "Notification listener re-established"
                            );
                            self.inner = listener;
                            return;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "Re-subscribe failed; retrying");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "Listener reconnect failed; retrying");
                }
            }

            delay = (delay * 2).min(self.backoff.cap);
        }
    }
}

async fn resubscribe(listener: &mut PgListener, channels: &[String]) -> Result<(), sqlx::Error> {
    for channel in channels {
        listener.listen(channel).await?;
    }
    Ok(())
}

/// Apply a symmetric jitter fraction to a delay.
fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(200);
        for _ in 0..100 {
            let delayed = jittered(base, 0.2);
            assert!(delayed >= Duration::from_millis(160));
            assert!(delayed <= Duration::from_millis(240));
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let base = Duration::from_millis(200);
        assert_eq!(jittered(base, 0.0), base);
    }
}
