// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The [`Transport`] trait is the seam between the session driver and the wire.
//! Each method performs one broker operation on the current connection or
//! channel and returns once the broker answered. Things the broker does on its
//! own (dropping the connection, confirming a publish, delivering a message) are
//! reported asynchronously through the [`EventSender`] handed over in
//! [`Transport::connect`].
//!
//! [`LapinTransport`] implements it on top of `lapin`.

use crate::{
    config::Endpoint,
    errors::AmqpError,
    exchange::ExchangeKind,
    otel,
    session::{Confirmation, Delivery, SessionEvent},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Sender half of a session's event queue.
pub type EventSender = UnboundedSender<SessionEvent>;

/// Broker operations used by a session.
///
/// Implementations report unsolicited closes on the sender handed to
/// [`Transport::connect`]: `ConnectionClosed` for the connection and
/// `ChannelClosed` for the channel opened by [`Transport::open_channel`].
#[async_trait]
pub trait Transport: Send {
    /// Opens a connection. Later connection loss is reported on `events`.
    async fn connect(&mut self, endpoint: &Endpoint, events: EventSender) -> Result<(), AmqpError>;

    async fn open_channel(&mut self) -> Result<(), AmqpError>;

    async fn declare_exchange(&mut self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError>;

    async fn declare_queue(&mut self, name: &str) -> Result<(), AmqpError>;

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn enable_confirms(&mut self) -> Result<(), AmqpError>;

    /// Sends `body`. The broker's confirm arrives later as `DeliveryConfirmed`.
    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), AmqpError>;

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts a consumer and returns its tag. Deliveries arrive as `MessageDelivered`.
    async fn consume(&mut self, queue: &str) -> Result<String, AmqpError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Cancels the consumer and waits for the broker's confirmation.
    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close_channel(&mut self) -> Result<(), AmqpError>;

    async fn close_connection(&mut self) -> Result<(), AmqpError>;
}

/// `lapin` backed transport.
pub struct LapinTransport {
    connection_name: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    events: Option<EventSender>,
}

impl LapinTransport {
    /// Creates a transport announcing itself to the broker as `connection_name`.
    pub fn new(connection_name: impl Into<String>) -> LapinTransport {
        LapinTransport {
            connection_name: connection_name.into(),
            connection: None,
            channel: None,
            events: None,
        }
    }

    fn channel(&self) -> Result<&Channel, AmqpError> {
        self.channel
            .as_ref()
            .ok_or_else(|| AmqpError::ChannelError("no open channel".to_owned()))
    }

    fn events(&self) -> Result<EventSender, AmqpError> {
        self.events
            .clone()
            .ok_or_else(|| AmqpError::InternalError("transport is not connected".to_owned()))
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&mut self, endpoint: &Endpoint, events: EventSender) -> Result<(), AmqpError> {
        let uri = endpoint.to_uri()?;
        info!(address = endpoint.address(), "connecting to broker");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect_uri(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        let on_error = events.clone();
        conn.on_error(move |err| {
            let _ = on_error.send(SessionEvent::ConnectionClosed(err.to_string()));
        });

        debug!("amqp connected");
        self.connection = Some(conn);
        self.channel = None;
        self.events = Some(events);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), AmqpError> {
        let conn = self
            .connection
            .as_ref()
            .ok_or_else(|| AmqpError::ChannelError("no open connection".to_owned()))?;

        let on_error = self.events()?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!(id = c.id(), "channel created");
                // broker-side closes arrive here, not on the connection
                c.on_error(move |err| {
                    let _ = on_error.send(SessionEvent::ChannelClosed(err.to_string()));
                });
                self.channel = Some(c);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn declare_exchange(&mut self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError> {
        match self
            .channel()?
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), AmqpError> {
        match self
            .channel()?
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel()?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn enable_confirms(&mut self) -> Result<(), AmqpError> {
        match self
            .channel()?
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to enable publisher confirms");
                Err(AmqpError::ConfirmSelectError)
            }
            _ => Ok(()),
        }
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), AmqpError> {
        let events = self.events()?;

        let confirm = match self
            .channel()?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(otel::trace_headers(&Context::current())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        tokio::spawn(async move {
            let outcome = match confirm.await {
                Ok(LapinConfirmation::Ack(_)) => Confirmation::Ack,
                Ok(LapinConfirmation::Nack(_)) => Confirmation::Nack,
                Ok(LapinConfirmation::NotRequested) => return,
                Err(err) => {
                    warn!(error = err.to_string(), "publisher confirm lost");
                    let _ = events.send(SessionEvent::ChannelClosed(err.to_string()));
                    return;
                }
            };
            let _ = events.send(SessionEvent::DeliveryConfirmed(outcome));
        });

        Ok(())
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel()?
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&mut self, queue: &str) -> Result<String, AmqpError> {
        let events = self.events()?;
        let tag = format!("{}-{}", self.connection_name, Uuid::new_v4());

        let mut consumer = match self
            .channel()?
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            headers: otel::string_headers(delivery.properties.headers().as_ref()),
                            body: delivery.data,
                        };
                        if events.send(SessionEvent::MessageDelivered(delivery)).is_err() {
                            return;
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!("consumer stream ended");
            let _ = events.send(SessionEvent::ConsumerCancelled);
        });

        Ok(tag)
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel()?
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel()?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close_channel(&mut self) -> Result<(), AmqpError> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        info!("closing the channel");
        if let Err(err) = channel.close(REPLY_SUCCESS, "channel closed by client").await {
            warn!(error = err.to_string(), "error to close the channel");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), AmqpError> {
        self.channel = None;
        let Some(conn) = self.connection.take() else {
            return Ok(());
        };

        info!("closing connection");
        if let Err(err) = conn.close(REPLY_SUCCESS, "connection closed by client").await {
            warn!(error = err.to_string(), "error to close the connection");
            return Err(AmqpError::ConnectionError(err.to_string()));
        }
        Ok(())
    }
}
