//! Seeding policy: the initial working set of subscriptions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::SubscriptionManager;
use crate::platform::{PlatformClient, PlatformError};

/// Attempts made to fetch the channel list.
const LIST_ATTEMPTS: u32 = 3;

/// Seeds a manager with subscriptions chosen by some policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Seeder: Send + Sync {
    /// Subscribe `manager` to the policy's entities; returns how many succeeded.
    async fn seed(&self, manager: Arc<dyn SubscriptionManager>) -> Result<usize>;
}

/// Where the channels to seed come from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Ids of the `count` most-watched live channels.
    async fn top_channels(&self, count: usize) -> Result<Vec<String>, PlatformError>;

    /// Topic URL for a channel's stream-change notifications.
    fn topic_for(&self, channel_id: &str) -> String;
}

#[async_trait]
impl ChannelDirectory for PlatformClient {
    async fn top_channels(&self, count: usize) -> Result<Vec<String>, PlatformError> {
        self.top_streams(count).await
    }

    fn topic_for(&self, channel_id: &str) -> String {
        self.stream_topic(channel_id)
    }
}

/// Subscribes to the stream changes of the most-watched live channels.
pub struct TopStreamsSeeder {
    directory: Arc<dyn ChannelDirectory>,
    count: usize,
    base_delay: Duration,
}

impl TopStreamsSeeder {
    pub fn new(directory: Arc<dyn ChannelDirectory>, count: usize) -> Self {
        Self {
            directory,
            count,
            base_delay: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    async fn channels(&self) -> Result<Vec<String>> {
        let mut attempt = 1;
        loop {
            match self.directory.top_channels(self.count).await {
                Ok(channels) => return Ok(channels),
                Err(e) if attempt < LIST_ATTEMPTS => {
                    let delay = backoff(attempt, self.base_delay);
                    warn!(attempt, delay = ?delay, error = %e, "listing channels failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e)
                        .context(format!("listing channels failed after {attempt} attempts"))
                }
            }
        }
    }
}

/// Exponential delay doubling from `base`, capped at 30 s.
fn backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(Duration::from_secs(30))
}

#[async_trait]
impl Seeder for TopStreamsSeeder {
    async fn seed(&self, manager: Arc<dyn SubscriptionManager>) -> Result<usize> {
        let channels = self.channels().await?;
        let mut subscribed = 0;
        for channel in &channels {
            let topic = self.directory.topic_for(channel);
            match manager.subscribe(&topic).await {
                Ok(_) => subscribed += 1,
                Err(e) => warn!(channel = %channel, error = %e, "seed subscription failed"),
            }
        }
        info!(requested = channels.len(), subscribed, "initial subscriptions seeded");
        if subscribed == 0 && !channels.is_empty() {
            anyhow::bail!("none of {} seed subscriptions succeeded", channels.len());
        }
        Ok(subscribed)
    }
}
