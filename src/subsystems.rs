//! Interfaces between the data system and its components.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    destination::{Basis, DataDestination},
    http::HttpConfig,
    status::DataSourceStatusReporter,
    ReadySignal, Result, Selector,
};

/// Obtains an initial data snapshot in a single request.
pub trait DataInitializer: Send + Sync {
    /// Name of the component, for logging.
    fn name(&self) -> &'static str;

    /// Fetch a full snapshot. Blocks for one request/response round trip.
    fn fetch(&self) -> Result<Basis>;
}

/// Keeps data up to date continuously.
pub trait DataSynchronizer: Send + Sync {
    /// Name of the component, for logging.
    fn name(&self) -> &'static str;

    /// Start synchronizing in the background and return immediately.
    ///
    /// `ready` fires once: after the first successful update, or after a permanent failure.
    /// `selector`, if defined, identifies data the caller already has.
    fn sync(&self, ready: ReadySignal, selector: Selector);

    /// Returns `true` once the synchronizer has delivered data.
    fn is_initialized(&self) -> bool;

    /// Stop synchronizing. Idempotent and safe to call while a request is in flight.
    fn close(&self);
}

/// Receives connection timing from the streaming synchronizer.
pub trait DiagnosticsRecorder: Send + Sync {
    /// Record the outcome of a stream connection attempt that started at `timestamp` and took
    /// `duration`.
    fn record_stream_init(&self, timestamp: DateTime<Utc>, failed: bool, duration: Duration);
}

/// Everything a component needs from its environment.
#[derive(Clone)]
pub struct ClientContext {
    /// SDK key sent in the `Authorization` header.
    pub sdk_key: String,
    /// HTTP settings shared by every component.
    pub http: HttpConfig,
    /// Where change sets are applied.
    pub destination: Arc<dyn DataDestination>,
    /// Where status changes are reported.
    pub status_reporter: Arc<dyn DataSourceStatusReporter>,
    /// Receives stream connection timing.
    pub diagnostics: Option<Arc<dyn DiagnosticsRecorder>>,
}

impl ClientContext {
    /// Create a context with default HTTP settings and no diagnostics.
    pub fn new(
        sdk_key: impl Into<String>,
        destination: Arc<dyn DataDestination>,
        status_reporter: Arc<dyn DataSourceStatusReporter>,
    ) -> ClientContext {
        ClientContext {
            sdk_key: sdk_key.into(),
            http: HttpConfig::default(),
            destination,
            status_reporter,
            diagnostics: None,
        }
    }

    /// Replace HTTP settings.
    pub fn with_http(mut self, http: HttpConfig) -> ClientContext {
        self.http = http;
        self
    }

    /// Report stream connection timing to `diagnostics`.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsRecorder>) -> ClientContext {
        self.diagnostics = Some(diagnostics);
        self
    }
}

/// Builds a component from a [`ClientContext`].
pub trait ComponentConfigurer<T>: Send + Sync {
    /// Build the component.
    fn build(&self, context: &ClientContext) -> Result<T>;
}
