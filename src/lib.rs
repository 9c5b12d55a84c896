// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod queue;
pub mod recorded;
pub mod recovery;
pub mod registry;
pub mod shutdown;
pub mod topology;
pub mod transport;

pub use channel::RecoveringChannel;
pub use config::{ConnectionParams, RecoveryConfig, RecoveryPolicy, TopologyRecoveryFilter};
pub use connection::RecoveringConnection;
pub use consumer::{ConsumerCallback, ConsumerDefinition, Delivery};
pub use errors::{AmqpError, ErrorScope};
pub use recovery::{RecoveryListener, RecoveryState};
pub use shutdown::{ShutdownListener, ShutdownSignal};
