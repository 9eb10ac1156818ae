//! Connection state notifications.

use crate::error::ClientError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// State of the session with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Connected and answering probes.
    Connected,
    /// Health check probes keep timing out.
    NotResponding,
    /// A probe failed with an error other than a timeout.
    Disconnected,
    /// Reconnecting gave up. No further events follow.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::NotResponding => "NotResponding",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a state transition.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub state: ConnectionState,
    pub error: Option<Arc<ClientError>>,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            timestamp: Utc::now(),
            state,
            error: None,
        }
    }

    pub fn with_error(mut self, error: ClientError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.state, self.timestamp.to_rfc3339())?;
        if let Some(err) = &self.error {
            write!(f, ": {}", err)?;
        }
        Ok(())
    }
}
