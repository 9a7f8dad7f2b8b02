// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Event Loop
//!
//! Runs a [`Session`] on its own thread. The thread drives a current-thread
//! tokio runtime with a single loop that:
//! 1. executes the session's pending commands against the transport, feeding each
//!    command's outcome straight back into [`Session::dispatch`];
//! 2. once nothing is pending, waits for the next event from the broker, the
//!    application, or the retry timer.
//!
//! Application threads talk to the loop only through [`SessionHandle`]: events go
//! in over an unbounded channel, the session state comes out over a watch
//! channel. The retry timer is a single deadline slot, so at most one retry is
//! ever pending.
//!
//! Publishes and acks are reported back to the role once the transport is done
//! with them, including the ones dropped because an earlier step failed or the
//! loop halted first.

use crate::{
    channel::declare_topology,
    config::Endpoint,
    errors::AmqpError,
    session::{Command, Role, Session, SessionEvent, SessionOptions, SessionState},
    topology::Topology,
    transport::{EventSender, Transport},
};
use std::{collections::VecDeque, thread};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, WeakUnboundedSender},
        oneshot, watch,
    },
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

/// The loop side: owns the session and the transport.
pub(crate) struct SessionDriver<R> {
    session: Session<R>,
    transport: Box<dyn Transport>,
    endpoint: Endpoint,
    /// Weak so that the loop notices when every producer of events is gone.
    events_tx: WeakUnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    state_tx: watch::Sender<SessionState>,
    retry_at: Option<Instant>,
}

impl<R: Role> SessionDriver<R> {
    /// Runs until the session halts.
    pub(crate) async fn run(mut self) {
        let mut commands: VecDeque<Command> = self.session.start().into();
        self.publish_state();

        loop {
            while let Some(command) = commands.pop_front() {
                if command == Command::Halt {
                    self.retry_at = None;
                    self.drain(std::mem::take(&mut commands));
                    self.publish_state();
                    info!(role = self.session.role().name(), "session loop halted");
                    return;
                }

                let Some(event) = self.execute(command).await else {
                    continue;
                };

                // a failed step invalidates whatever was queued behind it
                if event.is_failure() {
                    for dropped in commands.drain(..) {
                        self.session.settle(&dropped, false);
                    }
                }

                let next = self.session.dispatch(event);
                self.publish_state();
                for command in next.into_iter().rev() {
                    commands.push_front(command);
                }
            }

            let event = self.next_event().await;
            commands.extend(self.session.dispatch(event));
            self.publish_state();
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        let retry_at = self.retry_at;
        let events = &mut self.events_rx;

        let received = tokio::select! {
            event = events.recv() => Some(event),
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => None,
        };

        match received {
            Some(Some(event)) => event,
            // handle and transport both dropped their senders
            Some(None) => {
                warn!("session handle is gone, stopping");
                SessionEvent::StopRequested
            }
            None => {
                self.retry_at = None;
                SessionEvent::RetryElapsed
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Option<SessionEvent> {
        match command {
            Command::Connect => Some(self.connect().await),

            Command::ScheduleRetry(delay) => {
                debug!(?delay, "retry scheduled");
                self.retry_at = Some(Instant::now() + delay);
                None
            }

            Command::OpenChannel => Some(match self.transport.open_channel().await {
                Ok(()) => SessionEvent::ChannelOpened,
                Err(err) => SessionEvent::ChannelClosed(err.to_string()),
            }),

            Command::DeclareTopology => Some(
                match declare_topology(self.transport.as_mut(), self.session.topology()).await {
                    Ok(()) => SessionEvent::TopologyReady,
                    Err(err) => SessionEvent::ChannelClosed(err.to_string()),
                },
            ),

            Command::EnableConfirms => Some(match self.transport.enable_confirms().await {
                Ok(()) => SessionEvent::ConfirmsEnabled,
                Err(err) => SessionEvent::ChannelClosed(err.to_string()),
            }),

            Command::Publish(body) => {
                let topology = self.session.topology();
                let exchange = topology.exchange_name().unwrap_or_default();
                let result = self
                    .transport
                    .publish(exchange, topology.effective_routing_key(), &body)
                    .await;

                self.session.settle(&Command::Publish(body), result.is_ok());
                result
                    .err()
                    .map(|err| SessionEvent::ChannelClosed(err.to_string()))
            }

            Command::SetQos(prefetch_count) => {
                Some(match self.transport.set_qos(prefetch_count).await {
                    Ok(()) => SessionEvent::QosApplied,
                    Err(err) => SessionEvent::ChannelClosed(err.to_string()),
                })
            }

            Command::StartConsuming => {
                let queue = self.session.topology().queue_name();
                Some(match self.transport.consume(queue).await {
                    Ok(tag) => SessionEvent::ConsumeStarted(tag),
                    Err(err) => SessionEvent::ChannelClosed(err.to_string()),
                })
            }

            Command::Ack(delivery_tag) => {
                let result = self.transport.ack(delivery_tag).await;
                self.session.settle(&Command::Ack(delivery_tag), result.is_ok());
                result
                    .err()
                    .map(|err| SessionEvent::ChannelClosed(err.to_string()))
            }

            Command::Handoff(body) => {
                self.session.handoff(body);
                None
            }

            Command::CancelConsumer(tag) => {
                debug!(consumer_tag = %tag, "sending consumer cancel to broker");
                Some(match self.transport.cancel(&tag).await {
                    Ok(()) => SessionEvent::ConsumerCancelled,
                    Err(err) => SessionEvent::ChannelClosed(err.to_string()),
                })
            }

            Command::CloseChannel => {
                if let Err(err) = self.transport.close_channel().await {
                    debug!(error = err.to_string(), "channel close reported an error");
                }
                Some(SessionEvent::ChannelClosed(
                    "channel closed by client".to_owned(),
                ))
            }

            Command::CloseConnection => {
                if let Err(err) = self.transport.close_connection().await {
                    debug!(error = err.to_string(), "connection close reported an error");
                }
                Some(SessionEvent::ConnectionClosed(
                    "connection closed by client".to_owned(),
                ))
            }

            Command::Halt => None,
        }
    }

    /// Settles everything left behind once the loop halts: queued commands and
    /// events nobody will dispatch any more.
    fn drain(&mut self, commands: VecDeque<Command>) {
        for command in commands {
            self.session.settle(&command, false);
        }

        // no new sends succeed after close, buffered events are still received
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            self.session.discard(event);
        }
    }

    /// One connection attempt, abandoned as soon as shutdown is signalled.
    async fn connect(&mut self) -> SessionEvent {
        let Some(events) = self.events_tx.upgrade() else {
            return SessionEvent::ConnectionFailed("session handle is gone".to_owned());
        };

        let mut shutdown = self.shutdown.clone();
        let attempt = self.transport.connect(&self.endpoint, events);

        tokio::select! {
            result = attempt => match result {
                Ok(()) => SessionEvent::ConnectionOpened,
                Err(err) => SessionEvent::ConnectionFailed(err.to_string()),
            },
            _ = shutdown.wait_for(|stop| *stop) => {
                warn!("connection attempt aborted by shutdown");
                SessionEvent::ConnectionFailed("connection attempt aborted".to_owned())
            }
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.session.state());
    }
}

/// Everything the loop needs, held until `start`.
struct DriverParts {
    topology: Topology,
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    options: SessionOptions,
    events_rx: UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

/// The application side of a running session.
pub(crate) struct SessionHandle {
    events: EventSender,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    parts: Option<DriverParts>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(
        topology: Topology,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> SessionHandle {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let (state_tx, state) = watch::channel(SessionState::Disconnected);

        SessionHandle {
            events,
            shutdown,
            state,
            parts: Some(DriverParts {
                topology,
                endpoint,
                transport,
                options,
                events_rx,
                state_tx,
            }),
            thread: None,
        }
    }

    /// Spawns the loop thread for `role`. A handle starts at most once.
    ///
    /// # Returns
    /// `SessionAlreadyStarted` on a second call, `InternalError` when the
    /// runtime or the thread cannot be created
    pub(crate) fn start<R: Role>(&mut self, role: R) -> Result<(), AmqpError> {
        self.try_start(role).map_err(|(err, _)| err)
    }

    /// Like [`SessionHandle::start`], but hands `role` back when no loop was
    /// launched. The handle stays startable after an `InternalError`.
    pub(crate) fn try_start<R: Role>(&mut self, role: R) -> Result<(), (AmqpError, R)> {
        if self.parts.is_none() {
            return Err((AmqpError::SessionAlreadyStarted, role));
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = err.to_string(), "failure to build the session runtime");
                return Err((AmqpError::InternalError(err.to_string()), role));
            }
        };

        // the driver is handed over once the thread exists
        let (launch_tx, launch_rx) = oneshot::channel::<SessionDriver<R>>();
        let name = role.name();
        let spawned = thread::Builder::new()
            .name(format!("amqp-{name}"))
            .spawn(move || {
                runtime.block_on(async move {
                    let Ok(driver) = launch_rx.await else {
                        return;
                    };
                    info!(role = name, "session thread started");
                    driver.run().await;
                    info!(role = name, "session thread stopped");
                });
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                error!(error = err.to_string(), "failure to spawn the session thread");
                return Err((AmqpError::InternalError(err.to_string()), role));
            }
        };

        let Some(parts) = self.parts.take() else {
            return Err((AmqpError::SessionAlreadyStarted, role));
        };

        let driver = SessionDriver {
            session: Session::new(parts.topology, role, parts.options.retry_delay),
            transport: parts.transport,
            endpoint: parts.endpoint,
            events_tx: self.events.downgrade(),
            events_rx: parts.events_rx,
            shutdown: self.shutdown.subscribe(),
            state_tx: parts.state_tx,
            retry_at: None,
        };

        if let Err(driver) = launch_tx.send(driver) {
            error!("session thread exited before the launch");
            return Err((
                AmqpError::InternalError("session thread exited early".to_owned()),
                driver.session.into_role(),
            ));
        }

        self.thread = Some(thread);
        Ok(())
    }

    /// Queues an event for the loop. False once the loop is gone.
    pub(crate) fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Requests shutdown and waits for the loop thread to exit. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(parts) = self.parts.take() {
            // never started: nothing to unwind
            parts.state_tx.send_replace(SessionState::Closed);
            return;
        }

        let Some(thread) = self.thread.take() else {
            return;
        };

        self.shutdown.send_replace(true);
        let _ = self.events.send(SessionEvent::StopRequested);

        if thread.join().is_err() {
            error!("session thread panicked");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
