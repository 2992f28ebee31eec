use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::profile::PROFILE_FIELDS;

const MAX_RETRIES: u32 = 12;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection settings for the schedule broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Defaults to a random `heatzone-…` id when unset.
    pub client_id: Option<String>,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: None,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One schedule field received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldUpdate {
    pub topic: String,
    pub field: String,
    pub value: String,
}

/// Read-only broker client tracking one subscription set.
///
/// The transport loop runs in its own task and never touches shared
/// manager state; received fields are handed off through the returned
/// channel. Subscription bookkeeping survives disconnects so the ConnAck
/// path can replay it.
pub(crate) struct BrokerClient {
    client: AsyncClient,
    tracked: Arc<Mutex<HashSet<String>>>,
    state: Arc<AtomicU8>,
    event_task: JoinHandle<()>,
}

impl BrokerClient {
    pub fn connect(config: &BrokerConfig) -> (Self, mpsc::UnboundedReceiver<FieldUpdate>) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("heatzone-{}", Uuid::new_v4().simple()));
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        info!(host = %config.host, port = config.port, "connecting to schedule broker");
        let (client, mut eventloop) = AsyncClient::new(options, 32);

        let tracked: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));
        let (tx, rx) = mpsc::unbounded_channel();

        let task_client = client.clone();
        let task_tracked = Arc::clone(&tracked);
        let task_state = Arc::clone(&state);
        let event_task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to schedule broker");
                        task_state.store(ConnectionState::Connected as u8, Ordering::SeqCst);
                        failures = 0;
                        // rumqttc does not auto-resubscribe after a broker
                        // session loss, so replay every tracked topic here.
                        let topics: Vec<String> = {
                            let tracked = task_tracked.lock().unwrap();
                            tracked.iter().cloned().collect()
                        };
                        for topic in topics {
                            subscribe_fields(&task_client, &topic).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(value) = String::from_utf8(publish.payload.to_vec()) else {
                            warn!(topic = %publish.topic, "dropping non-UTF-8 payload");
                            continue;
                        };
                        let matched = {
                            let tracked = task_tracked.lock().unwrap();
                            demux(&tracked, &publish.topic)
                        };
                        if let Some((topic, field)) = matched {
                            debug!(topic = %topic, field = %field, "schedule field received");
                            if tx.send(FieldUpdate { topic, field, value }).is_err() {
                                debug!("field channel closed, stopping broker loop");
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        task_state.store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                        failures += 1;
                        if failures >= MAX_RETRIES {
                            error!(failures, "giving up on schedule broker");
                            return;
                        }
                        warn!(failures, error = %e, "broker connection lost, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        task_state.store(ConnectionState::Connecting as u8, Ordering::SeqCst);
                    }
                }
            }
        });

        (
            Self {
                client,
                tracked,
                state,
                event_task,
            },
            rx,
        )
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Subscribes all sub-topics of a profile. Idempotent; while
    /// disconnected only the bookkeeping is updated and the broker
    /// round-trip is left to the next ConnAck.
    pub async fn subscribe_profile(&self, topic: &str) {
        {
            let mut tracked = self.tracked.lock().unwrap();
            if !tracked.insert(topic.to_string()) {
                debug!(topic = %topic, "profile already subscribed");
                return;
            }
        }
        if !self.is_connected() {
            warn!(topic = %topic, "broker not connected, subscription deferred");
            return;
        }
        subscribe_fields(&self.client, topic).await;
        info!(topic = %topic, fields = PROFILE_FIELDS.len(), "subscribed schedule profile");
    }

    /// Drops a profile's subscriptions. Unsubscribing an untracked topic
    /// is a no-op.
    pub async fn unsubscribe_profile(&self, topic: &str) {
        {
            let mut tracked = self.tracked.lock().unwrap();
            if !tracked.remove(topic) {
                return;
            }
        }
        if !self.is_connected() {
            warn!(topic = %topic, "broker not connected, skipping unsubscribe");
            return;
        }
        for field in PROFILE_FIELDS {
            let full = format!("{topic}/{field}");
            if let Err(e) = self.client.unsubscribe(&full).await {
                warn!(topic = %full, error = %e, "unsubscribe failed");
            }
        }
        info!(topic = %topic, "unsubscribed schedule profile");
    }

    pub fn shutdown(&self) {
        self.event_task.abort();
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }
}

async fn subscribe_fields(client: &AsyncClient, topic: &str) {
    for field in PROFILE_FIELDS {
        let full = format!("{topic}/{field}");
        if let Err(e) = client.subscribe(&full, QoS::AtLeastOnce).await {
            warn!(topic = %full, error = %e, "subscribe failed");
        }
    }
}

/// Matches an inbound topic against the tracked prefixes; the trailing
/// path segment is the field name. Unmatched topics are dropped.
fn demux(tracked: &HashSet<String>, full_topic: &str) -> Option<(String, String)> {
    for topic in tracked {
        if let Some(rest) = full_topic.strip_prefix(topic.as_str())
            && rest.starts_with('/')
        {
            let field = rest.rsplit('/').next().unwrap_or("");
            if !field.is_empty() {
                return Some((topic.clone(), field.to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(topics: &[&str]) -> HashSet<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn demux_extracts_trailing_field() {
        let tracked = tracked(&["heatzone/profiles/day"]);
        assert_eq!(
            demux(&tracked, "heatzone/profiles/day/Temp1"),
            Some(("heatzone/profiles/day".to_string(), "Temp1".to_string()))
        );
    }

    #[test]
    fn demux_drops_unmatched_topics() {
        let tracked = tracked(&["heatzone/profiles/day"]);
        assert_eq!(demux(&tracked, "heatzone/profiles/night/Temp1"), None);
        assert_eq!(demux(&tracked, "heatzone/profiles/day"), None);
        assert_eq!(demux(&tracked, "other/topic"), None);
    }

    #[test]
    fn demux_takes_last_segment_of_deeper_paths() {
        let tracked = tracked(&["heatzone/profiles/day"]);
        assert_eq!(
            demux(&tracked, "heatzone/profiles/day/nested/Day1"),
            Some(("heatzone/profiles/day".to_string(), "Day1".to_string()))
        );
    }

    #[test]
    fn config_builder() {
        let config = BrokerConfig::new("broker.local", 1883)
            .credentials("mqtt", "secret")
            .client_id("heatzone-test");
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.username.as_deref(), Some("mqtt"));
        assert_eq!(config.client_id.as_deref(), Some("heatzone-test"));
    }

    #[tokio::test]
    async fn subscribe_bookkeeping_is_idempotent_while_disconnected() {
        let config = BrokerConfig::new("127.0.0.1", 1);
        let (client, _rx) = BrokerClient::connect(&config);
        assert_ne!(client.connection_state(), ConnectionState::Connected);

        client.subscribe_profile("heatzone/profiles/day").await;
        client.subscribe_profile("heatzone/profiles/day").await;
        assert_eq!(client.tracked_count(), 1);

        client.unsubscribe_profile("heatzone/profiles/day").await;
        client.unsubscribe_profile("heatzone/profiles/day").await;
        assert_eq!(client.tracked_count(), 0);

        client.shutdown();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
