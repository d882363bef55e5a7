//! Topic to channel registry.

use ripple_core::{RealtimeConfig, RippleConfig};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::channel::Channel;
use crate::connector::{Connector, WebSocketConnector};
use crate::error::RealtimeError;

/// Creates channels on first use and hands out the same channel for a topic
/// afterwards.
pub struct RealtimeClient {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    channels: RwLock<HashMap<String, Channel>>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.config.url)
            .field("channels", &self.topics())
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn from_config(config: &RippleConfig) -> Self {
        Self::new(config.realtime.clone())
    }

    pub fn with_connector(config: RealtimeConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// The channel for `topic`, created if needed. Creating a channel does
    /// not connect it.
    pub fn channel(&self, topic: &str) -> Result<Channel, RealtimeError> {
        if let Some(channel) = self.read().get(topic) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        match channels.entry(topic.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let channel = Channel::new(topic, self.config.clone(), self.connector.clone())?;
                tracing::debug!(topic, url = %channel.url(), "Channel created");
                Ok(entry.insert(channel).clone())
            }
        }
    }

    /// All channels, ordered by topic.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.read().values().cloned().collect();
        channels.sort_by(|a, b| a.topic().cmp(b.topic()));
        channels
    }

    pub fn topics(&self) -> Vec<String> {
        self.channels().iter().map(|c| c.topic().to_string()).collect()
    }

    /// Disconnect and forget the channel for `topic`. Returns false if there
    /// was none.
    pub async fn remove_channel(&self, topic: &str) -> bool {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        match removed {
            Some(channel) => {
                channel.disconnect().await;
                tracing::debug!(topic, "Channel removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect every channel. Channels and their subscriptions are kept.
    pub async fn disconnect_all(&self) {
        for channel in self.channels() {
            channel.disconnect().await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Channel>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RealtimeClient {
        RealtimeClient::new(RealtimeConfig {
            url: "ws://localhost:4000/realtime".to_string(),
            api_key: Some("anon".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_channels_are_memoised() {
        let client = client();
        let a = client.channel("orders").unwrap();
        a.on_stream("clicks", |_| {});

        let b = client.channel("orders").unwrap();
        assert_eq!(b.subscriptions().len(), 1);
        assert_eq!(b.url().as_str(), "ws://localhost:4000/realtime/orders?apikey=anon");

        client.channel("alerts").unwrap();
        assert_eq!(client.topics(), vec!["alerts", "orders"]);
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let client = RealtimeClient::new(RealtimeConfig {
            url: "mailto:nobody".to_string(),
            ..Default::default()
        });
        assert!(matches!(client.channel("t"), Err(RealtimeError::InvalidUrl(_))));
        assert!(client.channels().is_empty());
    }

    #[tokio::test]
    async fn test_remove_channel() {
        let client = client();
        client.channel("orders").unwrap();
        assert!(client.remove_channel("orders").await);
        assert!(!client.remove_channel("orders").await);
        assert!(client.channels().is_empty());
    }
}
