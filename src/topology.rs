// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Descriptor
//!
//! Describes what a channel must declare before messages can flow: the target
//! queue, an optional exchange and its kind, and the routing key used both to bind
//! the queue and to publish.
//!
//! Two rules shape the descriptor:
//! - with no exchange (empty name) messages go through the broker's default
//!   exchange, where the routing key must be the queue name, so any configured key
//!   is ignored;
//! - with a named exchange the queue has to be bound to it before a role may start,
//!   using the routing key or, when none was given, the queue name.

use crate::{errors::AmqpError, exchange::ExchangeKind};

/// Queue, exchange and routing key for one session. Immutable once a session is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    queue: String,
    exchange: String,
    kind: ExchangeKind,
    routing_key: String,
}

impl Topology {
    /// Creates a descriptor that publishes straight to `queue` through the default exchange.
    pub fn new(queue: impl Into<String>) -> Topology {
        Topology {
            queue: queue.into(),
            exchange: String::new(),
            kind: ExchangeKind::Direct,
            routing_key: String::new(),
        }
    }

    /// Routes through the named exchange. An empty name keeps the default exchange.
    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchange = name.into();
        self
    }

    /// Sets the kind the exchange is declared with.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the routing key. Ignored when no exchange is configured.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Rejects descriptors no broker would accept.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "queue name must not be empty".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// The exchange to declare and publish to, `None` for the default exchange.
    pub fn exchange_name(&self) -> Option<&str> {
        if self.exchange.is_empty() {
            None
        } else {
            Some(&self.exchange)
        }
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// The routing key messages are published with.
    pub fn effective_routing_key(&self) -> &str {
        if self.exchange.is_empty() || self.routing_key.is_empty() {
            &self.queue
        } else {
            &self.routing_key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_exchange_routes_by_queue_name() {
        let topology = Topology::new("samples").routing_key("ignored");

        assert_eq!(topology.exchange_name(), None);
        assert_eq!(topology.effective_routing_key(), "samples");
    }

    #[test]
    fn named_exchange_keeps_routing_key() {
        let topology = Topology::new("samples")
            .exchange("telemetry")
            .kind(ExchangeKind::Topic)
            .routing_key("sensehat.env");

        assert_eq!(topology.exchange_name(), Some("telemetry"));
        assert_eq!(topology.exchange_kind(), &ExchangeKind::Topic);
        assert_eq!(topology.effective_routing_key(), "sensehat.env");
    }

    #[test]
    fn named_exchange_without_key_binds_with_queue_name() {
        let topology = Topology::new("samples").exchange("telemetry");

        assert_eq!(topology.effective_routing_key(), "samples");
    }

    #[test]
    fn empty_queue_is_rejected() {
        assert!(matches!(
            Topology::new("  ").validate(),
            Err(AmqpError::InvalidTopology(_))
        ));
        assert!(Topology::new("samples").validate().is_ok());
    }
}
