// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session State Machine
//!
//! A [`Session`] owns the lifecycle of one broker connection and the channel on
//! top of it. It performs no I/O: every connection, channel and delivery
//! happening is fed in as a [`SessionEvent`] through [`Session::dispatch`], and
//! the session answers with the [`Command`]s the driver must execute next. The
//! driver (see `dispatcher`) runs those commands against a transport and feeds
//! their outcome back in as further events, strictly one at a time.
//!
//! The connection side is handled here, the channel side by the channel
//! manager, and everything between "topology ready" and "stop" by the pluggable
//! [`Role`] (producer or consumer).
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ChannelOpening -> Ready
//!      ^              |                                          |
//!      +-- retry -----+------ unplanned close -------------------+
//!                                                                |
//!                       stop() -> Closing -> Closed <------------+
//! ```
//!
//! Failures never leave the session. A failed or dropped connection schedules a
//! single retry after a fixed delay, and a closed channel closes its connection
//! so that it joins the same path. Only the shutdown flag set by
//! `StopRequested` ends the cycle.

use crate::{channel::ChannelManager, topology::Topology};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error, info, warn};

/// Fixed delay between a connection failure and the next attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default prefetch limit for consumers.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
/// Default connection name announced to the broker.
pub const DEFAULT_CONNECTION_NAME: &str = "sensehat-telemetry";

/// Tunables shared by producers and consumers.
///
/// Built the consuming-builder way: `SessionOptions::default().retry_delay(..)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub(crate) retry_delay: Duration,
    pub(crate) prefetch_count: u16,
    pub(crate) connection_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            retry_delay: DEFAULT_RETRY_DELAY,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
        }
    }
}

impl SessionOptions {
    /// Delay between a connection failure and the next attempt.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Maximum unacknowledged deliveries a consumer holds. Ignored by producers.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Connection name shown in the broker's management UI.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

/// Lifecycle of the connection owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelOpening,
    /// Topology declared, the role is running.
    Ready,
    Closing,
    /// Terminal. A stopped session is never restarted.
    Closed,
}

/// Outcome of a publisher confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// String-valued AMQP headers, including propagated trace context.
    pub headers: BTreeMap<String, String>,
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionOpened,
    ConnectionFailed(String),
    ConnectionClosed(String),
    ChannelOpened,
    ChannelClosed(String),
    TopologyReady,
    /// The pending retry timer fired.
    RetryElapsed,
    /// The channel accepted `confirm.select`.
    ConfirmsEnabled,
    DeliveryConfirmed(Confirmation),
    /// A serialized payload handed over by the application.
    PublishRequested(Vec<u8>),
    /// The channel accepted `basic.qos`.
    QosApplied,
    /// The broker registered the consumer under the given tag.
    ConsumeStarted(String),
    MessageDelivered(Delivery),
    /// The consumer is gone, either confirmed after our cancel or cancelled by the broker.
    ConsumerCancelled,
    StopRequested,
}

impl SessionEvent {
    /// Events reporting that the connection or channel is no longer usable.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionEvent::ConnectionFailed(_)
                | SessionEvent::ConnectionClosed(_)
                | SessionEvent::ChannelClosed(_)
        )
    }
}

/// Work the driver has to carry out on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    /// Arm the single retry timer.
    ScheduleRetry(Duration),
    OpenChannel,
    DeclareTopology,
    EnableConfirms,
    Publish(Vec<u8>),
    SetQos(u16),
    StartConsuming,
    Ack(u64),
    /// Hand a decoded payload to the role's callback.
    Handoff(String),
    CancelConsumer(String),
    CloseChannel,
    CloseConnection,
    /// Stop the driving loop.
    Halt,
}

/// What a session does once its topology is ready: publish or consume.
pub trait Role: Send + 'static {
    /// Short name used in logs and thread names.
    fn name(&self) -> &'static str;

    /// Topology declared on a fresh channel.
    fn on_topology_ready(&mut self) -> Vec<Command>;

    /// A role-level event while the session is ready.
    fn on_message_event(&mut self, event: SessionEvent) -> Vec<Command>;

    /// Shutdown requested while the channel is open. Must eventually close the channel.
    fn on_stop_requested(&mut self) -> Vec<Command>;

    /// The channel or the connection went away.
    fn on_channel_lost(&mut self);

    /// A payload acknowledged by [`Command::Ack`] is ready for the application.
    fn on_payload(&mut self, _body: String) {}

    /// Transport outcome of a [`Command::Publish`] or [`Command::Ack`] the role
    /// issued. A publish that never reached the transport settles as failed.
    fn on_settled(&mut self, _command: &Command, _succeeded: bool) {}
}

/// Connection and channel lifecycle for one role.
pub struct Session<R> {
    state: SessionState,
    shutdown: bool,
    retry_pending: bool,
    retry_delay: Duration,
    topology: Topology,
    channel: ChannelManager,
    role: R,
}

impl<R: Role> Session<R> {
    /// Creates a disconnected session.
    ///
    /// # Parameters
    /// * `topology` - What to declare on every fresh channel
    /// * `role` - Producer or consumer behaviour
    /// * `retry_delay` - Fixed delay before a reconnect
    pub fn new(topology: Topology, role: R, retry_delay: Duration) -> Session<R> {
        Session {
            state: SessionState::Disconnected,
            shutdown: false,
            retry_pending: false,
            retry_delay,
            topology,
            channel: ChannelManager::default(),
            role,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a retry timer is currently armed.
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn into_role(self) -> R {
        self.role
    }

    /// First connection attempt.
    ///
    /// # Returns
    /// `Connect`, or nothing when the session already ran
    pub fn start(&mut self) -> Vec<Command> {
        if self.shutdown || self.state != SessionState::Disconnected {
            warn!(state = ?self.state, "session already started");
            return vec![];
        }

        info!(role = self.role.name(), "starting session");
        self.state = SessionState::Connecting;
        vec![Command::Connect]
    }

    /// Advances the state machine by one event.
    ///
    /// # Parameters
    /// * `event` - What just happened on the connection, the channel or the application side
    ///
    /// # Returns
    /// The commands to execute next, in order
    pub fn dispatch(&mut self, event: SessionEvent) -> Vec<Command> {
        debug!(state = ?self.state, event = ?EventName(&event), "dispatching session event");

        match event {
            SessionEvent::ConnectionOpened => self.on_connection_opened(),
            SessionEvent::ConnectionFailed(reason) => self.on_connection_failed(&reason),
            SessionEvent::ConnectionClosed(reason) => self.on_connection_closed(&reason),
            SessionEvent::ChannelOpened => self.channel.on_channel_opened(self.shutdown),
            SessionEvent::ChannelClosed(reason) => self.on_channel_closed(&reason),
            SessionEvent::TopologyReady => self.on_topology_ready(),
            SessionEvent::RetryElapsed => self.on_retry_elapsed(),
            SessionEvent::StopRequested => self.on_stop_requested(),
            SessionEvent::ConsumerCancelled => {
                // still honoured during shutdown: it is the second half of a cancel
                if self.channel.is_open() {
                    self.role.on_message_event(SessionEvent::ConsumerCancelled)
                } else {
                    vec![]
                }
            }
            event => {
                if self.shutdown || self.state != SessionState::Ready {
                    debug!(state = ?self.state, event = ?EventName(&event), "ignoring event, session not ready");
                    self.discard(event);
                    return vec![];
                }
                self.role.on_message_event(event)
            }
        }
    }

    /// Forwards an acknowledged payload to the role.
    pub fn handoff(&mut self, body: String) {
        self.role.on_payload(body);
    }

    /// Reports the transport outcome of a role command.
    ///
    /// # Parameters
    /// * `command` - The command the driver executed or dropped
    /// * `succeeded` - Whether the broker operation went through
    pub fn settle(&mut self, command: &Command, succeeded: bool) {
        if matches!(command, Command::Publish(_) | Command::Ack(_)) {
            self.role.on_settled(command, succeeded);
        }
    }

    /// Drops an event that will never be dispatched. A pending publish is
    /// settled as failed so that it is not counted.
    pub fn discard(&mut self, event: SessionEvent) {
        if let SessionEvent::PublishRequested(body) = event {
            self.settle(&Command::Publish(body), false);
        }
    }

    fn on_connection_opened(&mut self) -> Vec<Command> {
        if self.shutdown {
            self.state = SessionState::Closing;
            return vec![Command::CloseConnection];
        }

        info!("connection opened");
        self.state = SessionState::Connected;

        debug!("opening channel");
        self.state = SessionState::ChannelOpening;
        vec![Command::OpenChannel]
    }

    fn on_connection_failed(&mut self, reason: &str) -> Vec<Command> {
        self.channel.on_connection_lost();
        self.role.on_channel_lost();

        if self.shutdown {
            self.state = SessionState::Closed;
            return vec![Command::Halt];
        }

        self.state = SessionState::Disconnected;
        error!(
            reason,
            retry_in = ?self.retry_delay,
            "failed to open connection"
        );
        self.schedule_retry()
    }

    fn on_connection_closed(&mut self, reason: &str) -> Vec<Command> {
        self.channel.on_connection_lost();
        self.role.on_channel_lost();

        if self.shutdown {
            info!("connection closed, session stopped");
            self.state = SessionState::Closed;
            return vec![Command::Halt];
        }

        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Closed
        ) {
            debug!(reason, "connection already closed");
            return vec![];
        }

        warn!(reason, retry_in = ?self.retry_delay, "connection closed, reopening");
        self.state = SessionState::Disconnected;
        self.schedule_retry()
    }

    fn on_channel_closed(&mut self, reason: &str) -> Vec<Command> {
        if !self.channel.is_open() && self.state != SessionState::ChannelOpening {
            debug!(reason, "channel already closed");
            return vec![];
        }

        self.role.on_channel_lost();
        if !self.shutdown {
            self.state = SessionState::Connected;
        }

        self.channel.on_channel_closed(reason, self.shutdown)
    }

    fn on_topology_ready(&mut self) -> Vec<Command> {
        if self.shutdown || !self.channel.is_open() {
            return vec![];
        }

        self.state = SessionState::Ready;
        self.role.on_topology_ready()
    }

    fn on_retry_elapsed(&mut self) -> Vec<Command> {
        self.retry_pending = false;

        if self.shutdown || self.state != SessionState::Disconnected {
            return vec![];
        }

        info!("reconnecting");
        self.state = SessionState::Connecting;
        vec![Command::Connect]
    }

    fn on_stop_requested(&mut self) -> Vec<Command> {
        if self.shutdown {
            debug!("session already stopping");
            return vec![];
        }

        info!(role = self.role.name(), "stopping session");
        self.shutdown = true;
        self.retry_pending = false;

        match self.state {
            SessionState::Disconnected | SessionState::Closed => {
                self.state = SessionState::Closed;
                vec![Command::Halt]
            }
            _ if self.channel.is_open() => {
                self.state = SessionState::Closing;
                let commands = self.role.on_stop_requested();
                if commands.is_empty() {
                    vec![Command::CloseChannel]
                } else {
                    commands
                }
            }
            _ => {
                self.state = SessionState::Closing;
                self.role.on_channel_lost();
                vec![Command::CloseConnection]
            }
        }
    }

    fn schedule_retry(&mut self) -> Vec<Command> {
        if self.retry_pending {
            debug!("retry already scheduled");
            return vec![];
        }

        self.retry_pending = true;
        vec![Command::ScheduleRetry(self.retry_delay)]
    }
}

/// Logs an event without dumping payload bytes.
struct EventName<'a>(&'a SessionEvent);

impl std::fmt::Debug for EventName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            SessionEvent::PublishRequested(body) => write!(f, "PublishRequested({} bytes)", body.len()),
            SessionEvent::MessageDelivered(delivery) => {
                write!(f, "MessageDelivered(tag={})", delivery.delivery_tag)
            }
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRole {
        events: Vec<SessionEvent>,
        lost: usize,
        stop_commands: Vec<Command>,
        settled: Vec<(Command, bool)>,
    }

    impl Role for RecordingRole {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn on_topology_ready(&mut self) -> Vec<Command> {
            vec![Command::EnableConfirms]
        }

        fn on_message_event(&mut self, event: SessionEvent) -> Vec<Command> {
            self.events.push(event);
            vec![]
        }

        fn on_stop_requested(&mut self) -> Vec<Command> {
            self.stop_commands.clone()
        }

        fn on_channel_lost(&mut self) {
            self.lost += 1;
        }

        fn on_settled(&mut self, command: &Command, succeeded: bool) {
            self.settled.push((command.clone(), succeeded));
        }
    }

    fn session() -> Session<RecordingRole> {
        Session::new(
            Topology::new("samples"),
            RecordingRole::default(),
            DEFAULT_RETRY_DELAY,
        )
    }

    fn ready_session() -> Session<RecordingRole> {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::ConnectionOpened);
        session.dispatch(SessionEvent::ChannelOpened);
        session.dispatch(SessionEvent::TopologyReady);
        session
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut session = session();

        assert_eq!(session.start(), vec![Command::Connect]);
        assert_eq!(session.state(), SessionState::Connecting);

        assert_eq!(
            session.dispatch(SessionEvent::ConnectionOpened),
            vec![Command::OpenChannel]
        );
        assert_eq!(session.state(), SessionState::ChannelOpening);

        assert_eq!(
            session.dispatch(SessionEvent::ChannelOpened),
            vec![Command::DeclareTopology]
        );
        assert_eq!(
            session.dispatch(SessionEvent::TopologyReady),
            vec![Command::EnableConfirms]
        );
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn start_twice_is_ignored() {
        let mut session = session();
        session.start();

        assert!(session.start().is_empty());
    }

    #[test]
    fn connection_failure_schedules_retry() {
        let mut session = session();
        session.start();

        assert_eq!(
            session.dispatch(SessionEvent::ConnectionFailed("refused".into())),
            vec![Command::ScheduleRetry(DEFAULT_RETRY_DELAY)]
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.retry_pending());

        assert_eq!(
            session.dispatch(SessionEvent::RetryElapsed),
            vec![Command::Connect]
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.retry_pending());
    }

    #[test]
    fn never_more_than_one_retry_pending() {
        let mut session = session();
        session.start();

        let mut scheduled = 0;
        let events = [
            SessionEvent::ConnectionFailed("refused".into()),
            SessionEvent::ConnectionClosed("reset".into()),
            SessionEvent::ConnectionFailed("refused".into()),
            SessionEvent::ConnectionClosed("reset".into()),
        ];
        for event in events {
            scheduled += session
                .dispatch(event)
                .iter()
                .filter(|c| matches!(c, Command::ScheduleRetry(_)))
                .count();
        }

        assert_eq!(scheduled, 1);
    }

    #[test]
    fn unplanned_close_while_ready_reconnects() {
        let mut session = ready_session();

        assert_eq!(
            session.dispatch(SessionEvent::ConnectionClosed("heartbeat timeout".into())),
            vec![Command::ScheduleRetry(DEFAULT_RETRY_DELAY)]
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.role().lost, 1);
    }

    #[test]
    fn channel_close_funnels_into_connection_close() {
        let mut session = ready_session();

        assert_eq!(
            session.dispatch(SessionEvent::ChannelClosed("NOT_FOUND".into())),
            vec![Command::CloseConnection]
        );
        // duplicate notifications are dropped
        assert!(session
            .dispatch(SessionEvent::ChannelClosed("NOT_FOUND".into()))
            .is_empty());

        assert_eq!(
            session.dispatch(SessionEvent::ConnectionClosed("closed by client".into())),
            vec![Command::ScheduleRetry(DEFAULT_RETRY_DELAY)]
        );
    }

    #[test]
    fn failed_channel_open_closes_connection() {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::ConnectionOpened);

        assert_eq!(
            session.dispatch(SessionEvent::ChannelClosed("channel_max reached".into())),
            vec![Command::CloseConnection]
        );
    }

    #[test]
    fn role_events_only_reach_ready_role() {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::ConnectionOpened);

        session.dispatch(SessionEvent::DeliveryConfirmed(Confirmation::Ack));
        assert!(session.role().events.is_empty());

        session.dispatch(SessionEvent::ChannelOpened);
        session.dispatch(SessionEvent::TopologyReady);
        session.dispatch(SessionEvent::DeliveryConfirmed(Confirmation::Ack));
        assert_eq!(
            session.role().events,
            vec![SessionEvent::DeliveryConfirmed(Confirmation::Ack)]
        );
    }

    #[test]
    fn stop_while_disconnected_halts() {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::ConnectionFailed("refused".into()));

        assert_eq!(
            session.dispatch(SessionEvent::StopRequested),
            vec![Command::Halt]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.retry_pending());
        // a late timer does nothing
        assert!(session.dispatch(SessionEvent::RetryElapsed).is_empty());
    }

    #[test]
    fn stop_while_ready_unwinds_channel_then_connection() {
        let mut session = ready_session();

        assert_eq!(
            session.dispatch(SessionEvent::StopRequested),
            vec![Command::CloseChannel]
        );
        assert_eq!(session.state(), SessionState::Closing);

        assert_eq!(
            session.dispatch(SessionEvent::ChannelClosed("closed by client".into())),
            vec![Command::CloseConnection]
        );
        assert_eq!(
            session.dispatch(SessionEvent::ConnectionClosed("closed by client".into())),
            vec![Command::Halt]
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = ready_session();

        assert!(!session.dispatch(SessionEvent::StopRequested).is_empty());
        assert!(session.dispatch(SessionEvent::StopRequested).is_empty());
    }

    #[test]
    fn stop_before_channel_closes_connection() {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::ConnectionOpened);

        assert_eq!(
            session.dispatch(SessionEvent::StopRequested),
            vec![Command::CloseConnection]
        );
    }

    #[test]
    fn connection_opened_after_stop_is_closed() {
        let mut session = session();
        session.start();
        session.dispatch(SessionEvent::StopRequested);

        assert_eq!(
            session.dispatch(SessionEvent::ConnectionOpened),
            vec![Command::CloseConnection]
        );
    }

    #[test]
    fn confirmations_after_stop_are_ignored() {
        let mut session = ready_session();
        session.dispatch(SessionEvent::StopRequested);

        session.dispatch(SessionEvent::DeliveryConfirmed(Confirmation::Ack));
        assert!(session.role().events.is_empty());
    }

    #[test]
    fn consumer_cancel_passes_during_shutdown() {
        let mut session = ready_session();
        session.dispatch(SessionEvent::StopRequested);

        session.dispatch(SessionEvent::ConsumerCancelled);
        assert_eq!(session.role().events, vec![SessionEvent::ConsumerCancelled]);
    }

    #[test]
    fn publish_dropped_while_not_ready_is_settled_as_failed() {
        let mut session = ready_session();
        session.dispatch(SessionEvent::ConnectionClosed("reset".into()));

        assert!(session
            .dispatch(SessionEvent::PublishRequested(b"{}".to_vec()))
            .is_empty());
        assert_eq!(
            session.role().settled,
            vec![(Command::Publish(b"{}".to_vec()), false)]
        );
        assert!(session.role().events.is_empty());
    }

    #[test]
    fn only_publish_and_ack_are_settled() {
        let mut session = ready_session();

        session.settle(&Command::Ack(3), true);
        session.settle(&Command::CloseChannel, false);
        session.discard(SessionEvent::QosApplied);

        assert_eq!(session.role().settled, vec![(Command::Ack(3), true)]);
    }
}
