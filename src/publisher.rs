// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Telemetry Producer
//!
//! Publishes JSON payloads over a self-healing broker session. The producer
//! becomes ready once the topology is declared and publisher confirms are
//! enabled; until then `publish` is a no-op returning `false`, so it can be
//! called from a fixed-interval timer without any error handling.
//!
//! Every publish and every broker confirmation is accounted for in a
//! [`DeliveryLedger`] shared between the caller's thread and the session loop.

use crate::{
    config::{BrokerConfig, Endpoint},
    dispatcher::SessionHandle,
    errors::AmqpError,
    session::{Command, Confirmation, Role, SessionEvent, SessionOptions, SessionState},
    topology::Topology,
    transport::{LapinTransport, Transport},
};
use serde::Serialize;
use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};

/// Point-in-time copy of a producer's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
}

impl DeliveryStats {
    /// Share of published messages the broker refused, or `None` before the first publish.
    pub fn nack_ratio(&self) -> Option<f64> {
        if self.published == 0 {
            return None;
        }
        Some(self.nacked as f64 / self.published as f64)
    }

    /// Published messages without a confirmation yet.
    pub fn unconfirmed(&self) -> u64 {
        self.published.saturating_sub(self.acked + self.nacked)
    }
}

impl fmt::Display for DeliveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nack_ratio() {
            None => write!(f, "no data"),
            Some(ratio) => write!(
                f,
                "published {}, acked {}, nacked {} ({:.2}% nacked)",
                self.published,
                self.acked,
                self.nacked,
                ratio * 100.0
            ),
        }
    }
}

/// Delivery counters. `published` grows on the caller's thread and is taken
/// back on the session loop when the payload never reaches the broker.
/// Confirmations are recorded on the session loop only.
#[derive(Debug, Default)]
pub(crate) struct DeliveryLedger {
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl DeliveryLedger {
    pub(crate) fn record_publish(&self) -> u64 {
        self.published.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Takes back a publish that was never sent.
    pub(crate) fn revoke_publish(&self) {
        let confirmed = self.acked.load(Ordering::SeqCst) + self.nacked.load(Ordering::SeqCst);
        let _ = self
            .published
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > confirmed).then(|| n - 1)
            });
    }

    /// Counts a confirmation. Refused when it would outnumber the publishes.
    pub(crate) fn record_confirmation(&self, confirmation: Confirmation) -> bool {
        let confirmed = self.acked.load(Ordering::SeqCst) + self.nacked.load(Ordering::SeqCst);
        if confirmed >= self.published.load(Ordering::SeqCst) {
            return false;
        }

        match confirmation {
            Confirmation::Ack => self.acked.fetch_add(1, Ordering::SeqCst),
            Confirmation::Nack => self.nacked.fetch_add(1, Ordering::SeqCst),
        };
        true
    }

    pub(crate) fn snapshot(&self) -> DeliveryStats {
        // confirmations first: published can only have grown since
        let acked = self.acked.load(Ordering::SeqCst);
        let nacked = self.nacked.load(Ordering::SeqCst);
        let published = self.published.load(Ordering::SeqCst);

        DeliveryStats {
            published,
            acked,
            nacked,
        }
    }
}

/// Producer behaviour plugged into the session.
pub(crate) struct ProducerRole {
    ready: Arc<AtomicBool>,
    ledger: Arc<DeliveryLedger>,
}

impl ProducerRole {
    pub(crate) fn new(ready: Arc<AtomicBool>, ledger: Arc<DeliveryLedger>) -> ProducerRole {
        ProducerRole { ready, ledger }
    }
}

impl Role for ProducerRole {
    fn name(&self) -> &'static str {
        "producer"
    }

    fn on_topology_ready(&mut self) -> Vec<Command> {
        debug!("enabling publisher confirms");
        vec![Command::EnableConfirms]
    }

    fn on_message_event(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::ConfirmsEnabled => {
                self.ready.store(true, Ordering::SeqCst);
                info!("producer ready");
                vec![]
            }
            SessionEvent::PublishRequested(body) => {
                if !self.ready.load(Ordering::SeqCst) {
                    warn!(bytes = body.len(), "producer not ready, dropping payload");
                    self.ledger.revoke_publish();
                    return vec![];
                }
                vec![Command::Publish(body)]
            }
            SessionEvent::DeliveryConfirmed(confirmation) => {
                if !self.ledger.record_confirmation(confirmation) {
                    warn!(?confirmation, "confirmation without a matching publish");
                    return vec![];
                }
                if confirmation == Confirmation::Nack {
                    warn!("broker refused a message");
                }
                info!(stats = %self.ledger.snapshot(), "delivery confirmed");
                vec![]
            }
            other => {
                debug!(event = ?other, "producer ignores event");
                vec![]
            }
        }
    }

    fn on_stop_requested(&mut self) -> Vec<Command> {
        self.ready.store(false, Ordering::SeqCst);
        vec![Command::CloseChannel]
    }

    fn on_channel_lost(&mut self) {
        if self.ready.swap(false, Ordering::SeqCst) {
            warn!("producer lost its channel, not ready");
        }
    }

    fn on_settled(&mut self, command: &Command, succeeded: bool) {
        if let Command::Publish(body) = command {
            if !succeeded {
                self.ledger.revoke_publish();
                warn!(bytes = body.len(), stats = %self.ledger.snapshot(), "payload was not sent");
            }
        }
    }
}

/// Publishes payloads to one topology over an auto-reconnecting session.
///
/// ```no_run
/// use sensehat_telemetry::{publisher::Producer, topology::Topology};
///
/// let mut producer = Producer::new(Topology::new("samples"), "config.json")?;
/// producer.start()?;
/// if producer.is_ready() {
///     producer.publish(&serde_json::json!({"temperature_c": 21.5}));
/// }
/// producer.stop();
/// # Ok::<(), sensehat_telemetry::errors::AmqpError>(())
/// ```
pub struct Producer {
    handle: SessionHandle,
    ready: Arc<AtomicBool>,
    ledger: Arc<DeliveryLedger>,
}

impl Producer {
    /// Creates a producer from a broker config file.
    ///
    /// # Parameters
    /// * `topology` - Where the payloads go
    /// * `config_path` - JSON broker config, see [`BrokerConfig`]
    ///
    /// # Returns
    /// The producer, not yet started, or the configuration error
    pub fn new(topology: Topology, config_path: impl AsRef<Path>) -> Result<Producer, AmqpError> {
        let endpoint = BrokerConfig::load(config_path)?.endpoint()?;
        Producer::with_options(topology, endpoint, SessionOptions::default())
    }

    /// Creates a producer on the `lapin` transport.
    ///
    /// # Parameters
    /// * `topology` - Where the payloads go
    /// * `endpoint` - Broker to connect to
    /// * `options` - Retry delay and connection name
    ///
    /// # Returns
    /// The producer, not yet started, or `InvalidTopology`
    pub fn with_options(
        topology: Topology,
        endpoint: Endpoint,
        options: SessionOptions,
    ) -> Result<Producer, AmqpError> {
        let transport = LapinTransport::new(options.connection_name.clone());
        Producer::with_transport(topology, endpoint, Box::new(transport), options)
    }

    /// Creates a producer on a custom transport.
    ///
    /// # Parameters
    /// * `topology` - Where the payloads go
    /// * `endpoint` - Handed to the transport on every connection attempt
    /// * `transport` - Broker operations, see [`Transport`]
    /// * `options` - Retry delay and connection name
    ///
    /// # Returns
    /// The producer, not yet started, or `InvalidTopology`
    pub fn with_transport(
        topology: Topology,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Result<Producer, AmqpError> {
        topology.validate()?;

        Ok(Producer {
            handle: SessionHandle::new(topology, endpoint, transport, options),
            ready: Arc::new(AtomicBool::new(false)),
            ledger: Arc::new(DeliveryLedger::default()),
        })
    }

    /// Starts the session thread. Connection failures are retried there, never returned.
    ///
    /// # Returns
    /// `SessionAlreadyStarted` on a second call, `InternalError` when no thread could be spawned
    pub fn start(&mut self) -> Result<(), AmqpError> {
        let role = ProducerRole::new(self.ready.clone(), self.ledger.clone());
        self.handle.start(role)
    }

    /// Serializes `payload` to JSON and hands it to the session.
    ///
    /// # Parameters
    /// * `payload` - Anything serde can turn into JSON
    ///
    /// # Returns
    /// `false` when nothing was sent and nothing was counted. `true` when the
    /// payload was counted and handed over. If the channel goes away before it
    /// is sent, the count is taken back.
    pub fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        if !self.is_ready() {
            debug!("producer not ready, skipping publish");
            return false;
        }

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                error!(
                    error = AmqpError::SerializePayloadError(err.to_string()).to_string(),
                    "failure to serialize payload"
                );
                return false;
            }
        };

        self.ledger.record_publish();
        if !self.handle.send(SessionEvent::PublishRequested(body)) {
            self.ledger.revoke_publish();
            warn!("session loop is gone, payload dropped");
            return false;
        }

        info!(stats = %self.ledger.snapshot(), "payload published");
        true
    }

    /// Whether the channel is up with confirms enabled. Never blocks.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Snapshot of the delivery ledger.
    pub fn stats(&self) -> DeliveryStats {
        self.ledger.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Closes channel and connection and waits for the session thread. Idempotent.
    pub fn stop(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        self.handle.stop();
        info!(stats = %self.ledger.snapshot(), "producer stopped");
    }
}
