// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Manager
//!
//! Owns the channel half of a session: tracks whether the logical channel is open,
//! runs the topology declaration sequence once per connection, and turns every
//! channel loss into a connection close. Channels are never reopened on their
//! own; the only way back is through the session's reconnect path.
//!
//! Declare and bind failures are not a separate branch. The broker closes the
//! channel on a bad declare, so [`declare_topology`] returning an error is handled
//! exactly like any other channel close.

use crate::{errors::AmqpError, session::Command, topology::Topology, transport::Transport};
use tracing::{debug, info, warn};

/// Channel bookkeeping for one session.
#[derive(Debug, Default)]
pub(crate) struct ChannelManager {
    open: bool,
}

impl ChannelManager {
    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    /// Channel opened: declare the topology, or close straight away when shutting down.
    pub(crate) fn on_channel_opened(&mut self, shutdown: bool) -> Vec<Command> {
        self.open = true;
        info!("channel opened");

        if shutdown {
            return vec![Command::CloseChannel];
        }

        vec![Command::DeclareTopology]
    }

    /// Channel gone: the owning connection is closed too, whatever the reason.
    pub(crate) fn on_channel_closed(&mut self, reason: &str, shutdown: bool) -> Vec<Command> {
        self.open = false;

        if shutdown {
            debug!(reason, "channel closed during shutdown");
        } else {
            warn!(reason, "channel was closed, closing the connection");
        }

        vec![Command::CloseConnection]
    }

    /// Connection gone: any channel on it is gone as well.
    pub(crate) fn on_connection_lost(&mut self) {
        self.open = false;
    }
}

/// Declares exchange, queue and binding for `topology` on the open channel.
///
/// With the default exchange only the queue is declared. With a named exchange
/// the exchange is declared first, then the queue, then the queue is bound with
/// the effective routing key.
pub(crate) async fn declare_topology(
    transport: &mut (dyn Transport + '_),
    topology: &Topology,
) -> Result<(), AmqpError> {
    if let Some(exchange) = topology.exchange_name() {
        debug!(exchange, kind = %topology.exchange_kind(), "declaring exchange");
        transport
            .declare_exchange(exchange, topology.exchange_kind())
            .await?;
        debug!(exchange, "exchange declared");
    }

    debug!(queue = topology.queue_name(), "declaring queue");
    transport.declare_queue(topology.queue_name()).await?;
    debug!(queue = topology.queue_name(), "queue declared");

    if let Some(exchange) = topology.exchange_name() {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            topology.queue_name(),
            exchange,
            topology.effective_routing_key()
        );
        transport
            .bind_queue(
                topology.queue_name(),
                exchange,
                topology.effective_routing_key(),
            )
            .await?;
    }

    info!(queue = topology.queue_name(), "topology ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_channel_declares_topology() {
        let mut manager = ChannelManager::default();

        assert_eq!(manager.on_channel_opened(false), vec![Command::DeclareTopology]);
        assert!(manager.is_open());
    }

    #[test]
    fn opened_channel_during_shutdown_is_closed() {
        let mut manager = ChannelManager::default();

        assert_eq!(manager.on_channel_opened(true), vec![Command::CloseChannel]);
    }

    #[test]
    fn closed_channel_always_closes_connection() {
        let mut manager = ChannelManager::default();
        manager.on_channel_opened(false);

        assert_eq!(
            manager.on_channel_closed("PRECONDITION_FAILED", false),
            vec![Command::CloseConnection]
        );
        assert!(!manager.is_open());

        manager.on_channel_opened(false);
        assert_eq!(
            manager.on_channel_closed("closed by client", true),
            vec![Command::CloseConnection]
        );
    }
}
