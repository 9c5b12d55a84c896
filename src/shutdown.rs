// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shutdown Signals and Listener Fan-out
//!
//! Every connection or channel closure is described by a [`ShutdownSignal`]
//! that carries an explicit [`Initiator`]. The recovery state machine decides
//! whether to recover purely from that field, never from the shape of a
//! transport error.
//!
//! Listeners are stored in a [`Listeners`] set and invoked from a snapshot,
//! so no internal lock is held while application code runs. A listener is
//! free to close the very connection that is notifying it.

use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Who caused a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// The application called `close`.
    Application,
    /// The broker closed the connection or channel.
    Peer,
    /// The transport failed underneath (I/O error, missed heartbeats).
    Transport,
}

/// Describes why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub initiator: Initiator,
    /// `true` for connection-level closure, `false` for a channel-level one.
    pub hard: bool,
    pub cause: String,
}

impl ShutdownSignal {
    /// A shutdown the application asked for.
    pub fn application(hard: bool, cause: impl Into<String>) -> Self {
        ShutdownSignal {
            initiator: Initiator::Application,
            hard,
            cause: cause.into(),
        }
    }

    /// A `connection.close` or `channel.close` sent by the broker.
    pub fn peer(hard: bool, cause: impl Into<String>) -> Self {
        ShutdownSignal {
            initiator: Initiator::Peer,
            hard,
            cause: cause.into(),
        }
    }

    /// A network failure, missed heartbeats or an I/O error. Always hard.
    pub fn transport(cause: impl Into<String>) -> Self {
        ShutdownSignal {
            initiator: Initiator::Transport,
            hard: true,
            cause: cause.into(),
        }
    }

    pub fn is_initiated_by_application(&self) -> bool {
        self.initiator == Initiator::Application
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.hard { "connection" } else { "channel" };
        write!(f, "{level} shutdown by {:?}: {}", self.initiator, self.cause)
    }
}

/// Receives shutdown notifications for a connection or channel.
pub trait ShutdownListener: Send + Sync {
    fn shutdown_completed(&self, signal: &ShutdownSignal);
}

impl<F> ShutdownListener for F
where
    F: Fn(&ShutdownSignal) + Send + Sync,
{
    fn shutdown_completed(&self, signal: &ShutdownSignal) {
        self(signal)
    }
}

/// A set of listeners invoked outside of the lock that guards it.
pub struct Listeners<T: ?Sized> {
    inner: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Listeners {
            inner: Mutex::new(vec![]),
        }
    }
}

impl<T: ?Sized> Listeners<T> {
    pub fn add(&self, listener: Arc<T>) {
        self.inner.lock().push(listener);
    }

    /// Removes a listener previously added, compared by pointer identity.
    pub fn remove(&self, listener: &Arc<T>) {
        self.inner.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current listeners so they can be called without the lock.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.lock().clone()
    }
}

impl Listeners<dyn ShutdownListener> {
    /// Delivers `signal` to every registered listener, once each.
    pub fn fire(&self, signal: &ShutdownSignal) {
        for listener in self.snapshot() {
            listener.shutdown_completed(signal);
        }
    }
}
