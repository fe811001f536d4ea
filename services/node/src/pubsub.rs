//! Pub/sub bus client.
//!
//! A narrow trait multiplexes subject subscriptions and typed events over
//! NATS.  Components register their handlers before `start_up`; the
//! subscriptions are applied at connect time, and the underlying client
//! re-applies them across reconnects.  Per-subject decoders turn raw frames
//! into the [`BusEvent`] sum type before a handler runs.
//!
//! The node's claim on a routing identity lives in a JetStream key-value
//! bucket: `register_participant` writes `routing identity -> node` and
//! `fetch_last_known_node` reads it back for cross-node routing.

use async_trait::async_trait;
use bytes::Bytes;
use fabric_protocol::messages::{NodeJoined, ParticipantPassOver};
use futures::future::BoxFuture;
use futures::StreamExt;
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::NatsSettings;

/// Advisory node-arrival subject.
pub const NODE_JOINED_SUBJECT: &str = "v1/node/joined";

/// JetStream KV bucket mapping routing identity -> owning node.
pub const ROUTING_BUCKET: &str = "participant-routing";

/// Subject carrying direct messages forwarded to `node`.
pub fn passover_subject(node: &str) -> String {
    format!("v1/node/{node}/participants/pass-over")
}

// ---------------------------------------------------------------------------
// Typed events
// ---------------------------------------------------------------------------

/// Every event the node consumes from the bus, keyed by subject.
#[derive(Debug, Clone)]
pub enum BusEvent {
    PassOver(ParticipantPassOver),
    NodeJoined(NodeJoined),
}

/// Decodes a raw bus frame into a [`BusEvent`].
pub type EventDecoder = fn(&[u8]) -> Result<BusEvent, prost::DecodeError>;

/// Handles one decoded event; the closure owns (an `Arc` of) its subscriber.
pub type EventHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn decode_pass_over(bytes: &[u8]) -> Result<BusEvent, prost::DecodeError> {
    ParticipantPassOver::decode(bytes).map(BusEvent::PassOver)
}

pub fn decode_node_joined(bytes: &[u8]) -> Result<BusEvent, prost::DecodeError> {
    NodeJoined::decode(bytes).map(BusEvent::NodeJoined)
}

#[derive(Clone)]
struct Subscription {
    subject: String,
    owner: &'static str,
    decoder: EventDecoder,
    handler: EventHandler,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bus client is not connected")]
    NotConnected,
    #[error("connecting to the bus: {0}")]
    Connect(String),
    #[error("subscribing to '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("publishing on '{subject}': {reason}")]
    Publish { subject: String, reason: String },
    #[error("routing key-value store: {0}")]
    KeyValue(String),
    #[error("draining the bus connection: {0}")]
    Drain(String),
}

/// The node's contract with the cluster bus.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Connect to the configured cluster and apply registered subscriptions.
    async fn start_up(&self) -> Result<(), ClientError>;

    /// Close the connection gracefully.
    async fn shutdown(&self) -> Result<(), ClientError>;

    /// Declare that frames on `subject` decode via `decoder` and dispatch to
    /// `handler`.  May be called before `start_up`; `owner` names the
    /// subscribing component for logs.
    fn register_subscription_handler(
        &self,
        subject: String,
        decoder: EventDecoder,
        owner: &'static str,
        handler: EventHandler,
    );

    /// Which node last claimed traffic for `routing_identifier`, if any.
    async fn fetch_last_known_node(&self, routing_identifier: &str) -> Option<String>;

    /// Record that this node owns traffic for `routing_identifier`.
    async fn register_participant(&self, routing_identifier: &str) -> Result<(), ClientError>;

    /// Forward a direct message to `node`'s pass-over subject.
    async fn passover_direct_message_to(
        &self,
        node: &str,
        passover: ParticipantPassOver,
    ) -> Result<(), ClientError>;
}

// ---------------------------------------------------------------------------
// NATS implementation
// ---------------------------------------------------------------------------

struct BusConnection {
    client: async_nats::Client,
    routing: async_nats::jetstream::kv::Store,
}

pub struct NatsParticipantClient {
    settings: NatsSettings,
    node: String,
    subscriptions: Mutex<Vec<Subscription>>,
    connection: RwLock<Option<BusConnection>>,
}

impl NatsParticipantClient {
    pub fn new(settings: NatsSettings, node: String) -> Self {
        NatsParticipantClient {
            settings,
            node,
            subscriptions: Mutex::new(Vec::new()),
            connection: RwLock::new(None),
        }
    }

    async fn spawn_subscription(
        client: &async_nats::Client,
        subscription: Subscription,
    ) -> Result<(), ClientError> {
        let mut subscriber = client
            .subscribe(subscription.subject.clone())
            .await
            .map_err(|e| ClientError::Subscribe {
                subject: subscription.subject.clone(),
                reason: e.to_string(),
            })?;
        info!(
            subject = %subscription.subject,
            owner = subscription.owner,
            "subscription active"
        );
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match (subscription.decoder)(&message.payload) {
                    Ok(event) => (subscription.handler)(event).await,
                    Err(error) => warn!(
                        subject = %subscription.subject,
                        %error,
                        "dropping undecodable bus frame"
                    ),
                }
            }
            debug!(subject = %subscription.subject, "subscription stream ended");
        });
        Ok(())
    }
}

#[async_trait]
impl ParticipantClient for NatsParticipantClient {
    async fn start_up(&self) -> Result<(), ClientError> {
        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(self.settings.connect_timeout)
            .retry_on_initial_connect()
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("bus connected"),
                    async_nats::Event::Disconnected => warn!("bus disconnected"),
                    other => debug!(event = %other, "bus event"),
                }
            });
        options = if self.settings.allow_reconnect {
            let wait = self.settings.reconnect_time_wait;
            options
                .max_reconnects(self.settings.max_reconnect_attempts)
                .reconnect_delay_callback(move |_attempts| wait)
        } else {
            options.max_reconnects(0)
        };

        info!(
            servers = ?self.settings.servers,
            verbose = self.settings.verbose,
            "connecting to bus cluster"
        );
        let client = options
            .connect(self.settings.servers.join(","))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let jetstream = async_nats::jetstream::new(client.clone());
        let routing = match jetstream.get_key_value(ROUTING_BUCKET).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(async_nats::jetstream::kv::Config {
                    bucket: ROUTING_BUCKET.to_owned(),
                    ..Default::default()
                })
                .await
                .map_err(|e| ClientError::KeyValue(e.to_string()))?,
        };

        let subscriptions = self
            .subscriptions
            .lock()
            .expect("subscription table poisoned")
            .clone();
        for subscription in subscriptions {
            Self::spawn_subscription(&client, subscription).await?;
        }

        // Advisory only; peers log arrivals.
        let joined = NodeJoined {
            identifier: self.node.clone(),
        };
        if let Err(error) = client
            .publish(NODE_JOINED_SUBJECT, Bytes::from(joined.encode_to_vec()))
            .await
        {
            warn!(%error, "failed to announce node arrival");
        }

        *self.connection.write().await = Some(BusConnection { client, routing });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        if let Some(connection) = self.connection.write().await.take() {
            connection
                .client
                .drain()
                .await
                .map_err(|e| ClientError::Drain(e.to_string()))?;
            info!("bus connection drained");
        }
        Ok(())
    }

    fn register_subscription_handler(
        &self,
        subject: String,
        decoder: EventDecoder,
        owner: &'static str,
        handler: EventHandler,
    ) {
        debug!(subject = %subject, owner, "subscription registered");
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .push(Subscription {
                subject,
                owner,
                decoder,
                handler,
            });
    }

    async fn fetch_last_known_node(&self, routing_identifier: &str) -> Option<String> {
        let guard = self.connection.read().await;
        let Some(connection) = guard.as_ref() else {
            warn!("routing lookup while the bus is disconnected");
            return None;
        };
        match connection.routing.get(routing_identifier).await {
            Ok(Some(bytes)) => String::from_utf8(bytes.to_vec()).ok(),
            Ok(None) => None,
            Err(error) => {
                warn!(%error, routing = %routing_identifier, "routing lookup failed");
                None
            }
        }
    }

    async fn register_participant(&self, routing_identifier: &str) -> Result<(), ClientError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(ClientError::NotConnected)?;
        connection
            .routing
            .put(routing_identifier, Bytes::from(self.node.clone()))
            .await
            .map_err(|e| ClientError::KeyValue(e.to_string()))?;
        debug!(routing = %routing_identifier, node = %self.node, "participant registered");
        Ok(())
    }

    async fn passover_direct_message_to(
        &self,
        node: &str,
        passover: ParticipantPassOver,
    ) -> Result<(), ClientError> {
        let subject = passover_subject(node);
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(ClientError::NotConnected)?;
        connection
            .client
            .publish(subject.clone(), Bytes::from(passover.encode_to_vec()))
            .await
            .map_err(|e| ClientError::Publish {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;
        connection
            .client
            .flush()
            .await
            .map_err(|e| ClientError::Publish {
                subject,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake implementation (test mode)
// ---------------------------------------------------------------------------

/// In-memory bus for tests: records subscriptions, registrations, and
/// published pass-overs; `inject` drives handlers directly.  Never reaches
/// a network.
#[derive(Default)]
pub struct FakeParticipantClient {
    subscriptions: Mutex<Vec<Subscription>>,
    last_known_nodes: Mutex<HashMap<String, String>>,
    registered: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, ParticipantPassOver)>>,
    bus_down: AtomicBool,
}

impl FakeParticipantClient {
    pub fn new() -> Self {
        FakeParticipantClient::default()
    }

    /// Pretend the cluster already knows where a routing identity lives.
    pub fn seed_last_known_node(&self, routing_identifier: &str, node: &str) {
        self.last_known_nodes
            .lock()
            .expect("node table poisoned")
            .insert(routing_identifier.to_owned(), node.to_owned());
    }

    /// Make publish operations fail as if the bus were unreachable.
    pub fn set_bus_down(&self, down: bool) {
        self.bus_down.store(down, Ordering::SeqCst);
    }

    /// Deliver a raw frame to every handler subscribed to `subject`,
    /// returning how many handlers ran.
    pub async fn inject(&self, subject: &str, payload: &[u8]) -> usize {
        let matching: Vec<Subscription> = self
            .subscriptions
            .lock()
            .expect("subscription table poisoned")
            .iter()
            .filter(|subscription| subscription.subject == subject)
            .cloned()
            .collect();
        let mut dispatched = 0;
        for subscription in matching {
            match (subscription.decoder)(payload) {
                Ok(event) => {
                    (subscription.handler)(event).await;
                    dispatched += 1;
                }
                Err(error) => warn!(subject, %error, "fake client dropped undecodable frame"),
            }
        }
        dispatched
    }

    /// Pass-overs published so far, as `(subject, message)` pairs.
    pub fn published(&self) -> Vec<(String, ParticipantPassOver)> {
        self.published.lock().expect("publish log poisoned").clone()
    }

    /// Routing identifiers announced through `register_participant`.
    pub fn registered_participants(&self) -> Vec<String> {
        self.registered.lock().expect("registry log poisoned").clone()
    }
}

#[async_trait]
impl ParticipantClient for FakeParticipantClient {
    async fn start_up(&self) -> Result<(), ClientError> {
        let subscriptions = self
            .subscriptions
            .lock()
            .expect("subscription table poisoned");
        for subscription in subscriptions.iter() {
            info!(
                subject = %subscription.subject,
                owner = subscription.owner,
                "fake subscription active"
            );
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        Ok(())
    }

    fn register_subscription_handler(
        &self,
        subject: String,
        decoder: EventDecoder,
        owner: &'static str,
        handler: EventHandler,
    ) {
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .push(Subscription {
                subject,
                owner,
                decoder,
                handler,
            });
    }

    async fn fetch_last_known_node(&self, routing_identifier: &str) -> Option<String> {
        self.last_known_nodes
            .lock()
            .expect("node table poisoned")
            .get(routing_identifier)
            .cloned()
    }

    async fn register_participant(&self, routing_identifier: &str) -> Result<(), ClientError> {
        self.registered
            .lock()
            .expect("registry log poisoned")
            .push(routing_identifier.to_owned());
        Ok(())
    }

    async fn passover_direct_message_to(
        &self,
        node: &str,
        passover: ParticipantPassOver,
    ) -> Result<(), ClientError> {
        let subject = passover_subject(node);
        if self.bus_down.load(Ordering::SeqCst) {
            return Err(ClientError::Publish {
                subject,
                reason: "bus unavailable".to_owned(),
            });
        }
        self.published
            .lock()
            .expect("publish log poisoned")
            .push((subject, passover));
        Ok(())
    }
}
