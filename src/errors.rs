// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Telemetry Session
//!
//! `AmqpError` covers the three families of failures the crate can see: loading
//! the broker or sensor configuration, talking to the broker, and misusing a
//! session handle. Only configuration and lifecycle errors ever reach the application;
//! broker failures are turned into session events and retried.

use thiserror::Error;

/// Represents errors that can occur while configuring or driving a broker session.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// The broker configuration file does not exist
    #[error("broker configuration `{0}` does not exist")]
    ConfigNotFound(String),

    /// The broker configuration file could not be read or parsed
    #[error("failure to parse broker configuration `{0}`")]
    ConfigParseError(String),

    /// The configuration does not describe a usable endpoint
    #[error("invalid broker endpoint `{0}`")]
    InvalidEndpoint(String),

    /// The sensor configuration could not be read, parsed or created
    #[error("failure to load sensor configuration `{0}`")]
    SensorConfigError(String),

    /// The topology descriptor is not usable
    #[error("invalid topology `{0}`")]
    InvalidTopology(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or closing a channel
    #[error("failure on channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error switching the channel to publisher confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload to JSON
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// The handle was already started, or was stopped and cannot be restarted
    #[error("session was already started")]
    SessionAlreadyStarted,
}
