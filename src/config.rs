// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Recovery Configuration
//!
//! [`ConnectionParams`] and [`RecoveryConfig`] are plain data and can be
//! deserialized from the application's configuration source. Behaviour that
//! needs code, such as which shutdowns are recoverable and which entities are
//! excluded from recovery, lives in [`RecoveryPolicy`].

use crate::{
    recorded::{RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue},
    shutdown::ShutdownSignal,
};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};

/// Broker address in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: &str, port: u16) -> Address {
        Address {
            host: host.to_owned(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parameters used to open, and later re-open, a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Tried in order on every connection attempt.
    pub addresses: Vec<Address>,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    /// Requested heartbeat in seconds; 0 disables heartbeats.
    pub heartbeat: u16,
    /// Requested maximum frame size; 0 means no limit.
    pub frame_max: u32,
    /// Requested maximum channel number; 0 means no limit.
    pub channel_max: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            addresses: vec![Address::new("localhost", 5672)],
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-recovery".to_owned(),
            heartbeat: 60,
            frame_max: 131_072,
            channel_max: 2047,
        }
    }
}

impl ConnectionParams {
    /// Appends an address tried after the ones already configured.
    ///
    /// # Parameters
    /// * `host` - Broker host name
    /// * `port` - Broker port
    ///
    /// # Returns
    /// Self for method chaining
    pub fn address(mut self, host: &str, port: u16) -> Self {
        self.addresses.push(Address::new(host, port));
        self
    }

    /// Replaces the address list with a single address.
    pub fn only_address(mut self, host: &str, port: u16) -> Self {
        self.addresses = vec![Address::new(host, port)];
        self
    }

    /// Sets the credentials used on every connection attempt.
    ///
    /// # Parameters
    /// * `user` - The user name
    /// * `password` - The password
    ///
    /// # Returns
    /// Self for method chaining
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }
}

/// Automatic recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reconnect after an abnormal shutdown.
    pub automatic_recovery: bool,
    /// Replay recorded exchanges, queues, bindings and consumers after reconnecting.
    pub topology_recovery: bool,
    /// Delay before each reconnect attempt and between replay retries.
    #[serde(rename = "network_recovery_interval_ms", with = "millis")]
    pub network_recovery_interval: Duration,
    /// Reconnect attempts per recovery cycle; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Timeout applied to every synchronous call, including replay calls.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            automatic_recovery: true,
            topology_recovery: true,
            network_recovery_interval: Duration::from_secs(5),
            max_attempts: None,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RecoveryConfig {
    /// Settings that never reconnect: every abnormal shutdown abandons the connection.
    pub fn disabled() -> Self {
        RecoveryConfig {
            automatic_recovery: false,
            ..Default::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.network_recovery_interval = interval;
        self
    }

    /// Bounds the reconnect attempts of one recovery cycle.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn without_topology_recovery(mut self) -> Self {
        self.topology_recovery = false;
        self
    }

    /// Whether `attempts` already made exhaust the budget.
    pub(crate) fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-entity opt-out from topology recovery. Every method keeps the entity by default.
pub trait TopologyRecoveryFilter: Send + Sync {
    fn filter_exchange(&self, _exchange: &RecordedExchange) -> bool {
        true
    }

    fn filter_queue(&self, _queue: &RecordedQueue) -> bool {
        true
    }

    fn filter_binding(&self, _binding: &RecordedBinding) -> bool {
        true
    }

    fn filter_consumer(&self, _consumer: &RecordedConsumer) -> bool {
        true
    }
}

struct KeepAll;

impl TopologyRecoveryFilter for KeepAll {}

type RecoverablePredicate = dyn Fn(&ShutdownSignal) -> bool + Send + Sync;

/// Code-level recovery decisions.
#[derive(Clone)]
pub struct RecoveryPolicy {
    pub(crate) should_recover: Arc<RecoverablePredicate>,
    pub(crate) filter: Arc<dyn TopologyRecoveryFilter>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            should_recover: Arc::new(|signal: &ShutdownSignal| {
                !signal.is_initiated_by_application()
            }),
            filter: Arc::new(KeepAll),
        }
    }
}

impl fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPolicy").finish_non_exhaustive()
    }
}

impl RecoveryPolicy {
    /// Decides which abnormal shutdowns are recovered. Application-initiated
    /// closes are never recovered, whatever the predicate says.
    pub fn recover_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ShutdownSignal) -> bool + Send + Sync + 'static,
    {
        self.should_recover = Arc::new(predicate);
        self
    }

    pub fn topology_filter(mut self, filter: Arc<dyn TopologyRecoveryFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn is_recoverable(&self, signal: &ShutdownSignal) -> bool {
        !signal.is_initiated_by_application() && (self.should_recover)(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let cfg: RecoveryConfig = serde_json::from_str(
            r#"{ "network_recovery_interval_ms": 250, "max_attempts": 3 }"#,
        )
        .unwrap();

        assert!(cfg.automatic_recovery);
        assert!(cfg.topology_recovery);
        assert_eq!(cfg.network_recovery_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_attempts, Some(3));
        assert_eq!(cfg.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn deserializes_connection_params() {
        let params: ConnectionParams = serde_json::from_str(
            r#"{
                "addresses": [{ "host": "rabbit-1", "port": 5672 }, { "host": "rabbit-2", "port": 5673 }],
                "user": "app",
                "password": "secret"
            }"#,
        )
        .unwrap();

        assert_eq!(params.addresses.len(), 2);
        assert_eq!(params.addresses[1].to_string(), "rabbit-2:5673");
        assert_eq!(params.vhost, "/");
    }

    #[test]
    fn counts_attempt_budget() {
        let bounded = RecoveryConfig::default().max_attempts(2);
        assert!(!bounded.attempts_exhausted(1));
        assert!(bounded.attempts_exhausted(2));
        assert!(!RecoveryConfig::default().attempts_exhausted(u32::MAX));
    }

    #[test]
    fn never_recovers_application_close() {
        let policy = RecoveryPolicy::default().recover_when(|_| true);

        assert!(!policy.is_recoverable(&ShutdownSignal::application(true, "bye")));
        assert!(policy.is_recoverable(&ShutdownSignal::transport("reset")));
    }
}
