// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Recovering RabbitMQ Client
//!
//! This module provides the error taxonomy shared by the application handles,
//! the topology registry and the recovery orchestrator. Every `AmqpError` can be
//! classified with [`AmqpError::scope`], which is the only thing the recovery
//! state machine looks at when deciding whether to retry, skip an entity or
//! abandon the connection.

use std::time::Duration;
use thiserror::Error;

/// How far the consequences of an error reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Connection refused, reset, timed out. Retried under backoff.
    Retryable,
    /// The broker rejected one specific declaration. Siblings still recover.
    Entity,
    /// Authentication failure, incompatible negotiation, hard protocol error.
    Connection,
    /// The connection was closed by the application or recovery was abandoned.
    Closed,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport implementations map their native failures onto these variants,
/// so the recovery logic never has to inspect transport-specific error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing or keeping a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure on channel `{0}`")]
    ChannelError(String),

    /// A synchronous call did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused a specific declaration (e.g. PRECONDITION_FAILED)
    #[error("broker rejected the operation `{0}`")]
    EntityRejected(String),

    /// The broker refused the connection itself (e.g. ACCESS_REFUSED)
    #[error("broker rejected the connection `{0}`")]
    ConnectionRejected(String),

    /// The logical connection is closed; carries the original cause
    #[error("connection closed `{0}`")]
    ConnectionClosed(String),

    /// A channel handle was used after the application closed it
    #[error("channel `{0}` is closed")]
    ChannelClosed(u16),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a source to a destination
    #[error("failure to bind `{0}` to `{1}`")]
    BindingError(String, String),

    /// Error registering a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The broker negatively confirmed a publish on a confirm-mode channel
    #[error("failure to publish `{0}`")]
    PublishingError(String),
}

impl AmqpError {
    /// Classifies the error for the recovery state machine.
    pub fn scope(&self) -> ErrorScope {
        match self {
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::Timeout(_) => {
                ErrorScope::Retryable
            }
            AmqpError::EntityRejected(_)
            | AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingError(_, _)
            | AmqpError::BindingConsumerError(_)
            | AmqpError::PublishingError(_) => ErrorScope::Entity,
            AmqpError::ConnectionRejected(_) | AmqpError::InternalError(_) => {
                ErrorScope::Connection
            }
            AmqpError::ConnectionClosed(_) | AmqpError::ChannelClosed(_) => ErrorScope::Closed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.scope() == ErrorScope::Retryable
    }
}
