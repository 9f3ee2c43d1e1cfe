//! Data source status: what synchronizers report and how the reports are tracked.
use std::sync::{mpsc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::Serialize;

/// State of a data source.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DataSourceState {
    /// No data source has produced data or failed yet.
    #[display(fmt = "initializing")]
    Initializing,
    /// The data source is working and data is current.
    #[display(fmt = "valid")]
    Valid,
    /// The data source hit a recoverable problem and is retrying.
    #[display(fmt = "interrupted")]
    Interrupted,
    /// The data source was closed or failed permanently.
    #[display(fmt = "off")]
    Off,
}

/// Category of a data source failure.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The cause could not be classified.
    #[display(fmt = "unknown")]
    Unknown,
    /// The connection failed or timed out.
    #[display(fmt = "network error")]
    NetworkError,
    /// The server answered with an HTTP error status.
    #[display(fmt = "error response")]
    ErrorResponse,
    /// The server sent data that could not be decoded.
    #[display(fmt = "invalid data")]
    InvalidData,
    /// The persistent store failed to accept an update.
    #[display(fmt = "store error")]
    StoreError,
}

/// Details of a data source failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Category of the error.
    pub kind: ErrorKind,
    /// HTTP status, for [`ErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    /// Description of the error.
    pub message: String,
    /// When the error happened.
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    /// Error of the given kind with a message, timestamped now.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    /// Error for an HTTP error status, timestamped now.
    pub fn error_response(status_code: u16) -> ErrorInfo {
        ErrorInfo {
            kind: ErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: String::new(),
            time: Utc::now(),
        }
    }
}

/// Receives state transitions from synchronizers.
pub trait DataSourceStatusReporter: Send + Sync {
    /// Report a new state. `error` is `None` when the transition is not caused by a failure.
    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>);
}

/// Snapshot of the current data source status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    /// Current state.
    pub state: DataSourceState,
    /// When `state` was entered.
    pub state_since: DateTime<Utc>,
    /// Most recent failure, kept across later successful transitions.
    pub last_error: Option<ErrorInfo>,
}

/// Standard [`DataSourceStatusReporter`] that remembers the current status and broadcasts
/// changes to listeners.
pub struct DataSourceStatusTracker {
    status: RwLock<DataSourceStatus>,
    listeners: Mutex<Vec<mpsc::Sender<DataSourceStatus>>>,
}

impl DataSourceStatusTracker {
    /// Create a tracker in the [`DataSourceState::Initializing`] state.
    pub fn new() -> Self {
        DataSourceStatusTracker {
            status: RwLock::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> DataSourceStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Subscribe to status changes. The receiver gets every status that differs from the
    /// previous one. Dropping the receiver unsubscribes.
    pub fn add_listener(&self) -> mpsc::Receiver<DataSourceStatus> {
        let (sender, receiver) = mpsc::channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(sender);
        }
        receiver
    }

    fn broadcast(&self, status: &DataSourceStatus) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|listener| listener.send(status.clone()).is_ok());
        }
    }
}

impl Default for DataSourceStatusTracker {
    fn default() -> Self {
        DataSourceStatusTracker::new()
    }
}

impl DataSourceStatusReporter for DataSourceStatusTracker {
    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let updated = {
            let mut status = match self.status.write() {
                Ok(status) => status,
                Err(poisoned) => poisoned.into_inner(),
            };

            // A failure while still initializing does not count as an interruption: there was
            // nothing to interrupt yet.
            let state = if state == DataSourceState::Interrupted
                && status.state == DataSourceState::Initializing
            {
                DataSourceState::Initializing
            } else {
                state
            };

            if state == status.state && error.is_none() {
                return;
            }

            if state != status.state {
                log::debug!(target: "flagsync", from:serde = status.state, to:serde = state; "data source state changed");
                status.state = state;
                status.state_since = Utc::now();
            }
            if error.is_some() {
                status.last_error = error;
            }
            status.clone()
        };

        self.broadcast(&updated);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        DataSourceState, DataSourceStatusReporter, DataSourceStatusTracker, ErrorInfo, ErrorKind,
    };

    #[test]
    fn starts_initializing() {
        let tracker = DataSourceStatusTracker::new();

        let status = tracker.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn interruption_while_initializing_keeps_initializing() {
        let tracker = DataSourceStatusTracker::new();

        tracker.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorKind::NetworkError, "connection refused")),
        );

        let status = tracker.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::NetworkError);
    }

    #[test]
    fn interruption_after_valid_is_recorded() {
        let tracker = DataSourceStatusTracker::new();
        tracker.update_status(DataSourceState::Valid, None);

        tracker.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(503)),
        );

        let status = tracker.status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.last_error.unwrap().status_code, Some(503));
    }

    #[test]
    fn valid_keeps_last_error() {
        let tracker = DataSourceStatusTracker::new();
        tracker.update_status(DataSourceState::Valid, None);
        tracker.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorKind::InvalidData, "bad json")),
        );

        tracker.update_status(DataSourceState::Valid, None);

        let status = tracker.status();
        assert_eq!(status.state, DataSourceState::Valid);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::InvalidData);
    }

    #[test]
    fn listeners_receive_changes_only() {
        let tracker = DataSourceStatusTracker::new();
        let listener = tracker.add_listener();

        tracker.update_status(DataSourceState::Valid, None);
        tracker.update_status(DataSourceState::Valid, None);
        tracker.update_status(DataSourceState::Off, None);

        let first = listener.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = listener.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.state, DataSourceState::Valid);
        assert_eq!(second.state, DataSourceState::Off);
        assert!(listener.try_recv().is_err());
    }

    #[test]
    fn dropped_listeners_are_removed() {
        let tracker = DataSourceStatusTracker::new();
        drop(tracker.add_listener());

        tracker.update_status(DataSourceState::Valid, None);

        assert!(tracker.listeners.lock().unwrap().is_empty());
    }
}
