//! Data acquisition for feature flag SDKs.
//!
//! # Overview
//!
//! `flagsync` obtains a consistent snapshot of flag and segment data from a flag delivery
//! service and keeps it up to date. Updates arrive as change sets, each identified by a
//! [`Selector`], through one of two synchronizers:
//!
//! - the streaming synchronizer keeps a server-sent events connection open and applies each
//!   change set as soon as the server completes it;
//! - the polling synchronizer requests the data on a fixed interval.
//!
//! A [`DataSystem`] combines them with optional initializers and a persistent store. The
//! recommended strategy ([`DataSystemModes::default_mode`]) fetches a full snapshot once, then
//! streams updates, falling back to polling if streaming stays unavailable.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use flagsync::{DataSystemConfig, DataSystemModes, ObjectKind};
//! let data_system = DataSystemConfig::from_sdk_key("sdk-key")
//!     .start(&DataSystemModes::new().default_mode())?;
//! data_system.wait_for_ready(Duration::from_secs(5));
//! let flag = data_system.store().get(ObjectKind::Flag, "my-flag")?;
//! # Ok::<(), flagsync::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only configuration and setup errors are
//! returned to the caller. Failures while synchronizing are absorbed and reported through the
//! data source status (see [`DataSystem::status`]).
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `flagsync` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into data system operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod backoff;
mod changeset;
mod config;
mod data_system;
mod destination;
mod error;
mod http;
mod polling;
mod protocol;
mod ready;
mod selector;
mod status;
mod store;
mod streaming;
mod subsystems;

#[cfg(test)]
mod test_support;

pub use backoff::Backoff;
pub use changeset::{Change, ChangeSet, ChangeSetBuilder, ChangeType, IntentCode, ObjectKind};
pub use config::{
    DataStoreConfigurer, DataSystemConfiguration, DataSystemConfigurationBuilder,
    DataSystemModes, Endpoints, InitializerConfigurer, PollingDataSourceBuilder,
    PollingInitializerBuilder, StreamingDataSourceBuilder, SynchronizerConfigurer,
    SynchronizersConfiguration, DEFAULT_POLLING_BASE_URI, DEFAULT_STREAMING_BASE_URI,
};
pub use data_system::{DataSystem, DataSystemConfig};
pub use destination::{Basis, DataDestination, StoreDestination};
pub use error::{Error, Result};
pub use http::{http_error_description, is_http_error_recoverable, HttpConfig};
pub use polling::{HttpPollingRequester, PollingProcessor, PollingRequester};
pub use protocol::{
    DeleteObject, ErrorEvent, EventName, Goodbye, PollingEvent, PollingPayload, ProtocolEvent, PutObject,
    ServerIntent, ServerIntentPayload,
};
pub use ready::ReadySignal;
pub use selector::Selector;
pub use status::{
    DataSourceState, DataSourceStatus, DataSourceStatusReporter, DataSourceStatusTracker,
    ErrorInfo, ErrorKind,
};
pub use store::{AllData, DataStore, DataStoreMode, InMemoryDataStore, ItemDescriptor, KeyedItems};
pub use streaming::{StreamConfig, StreamProcessor};
pub use subsystems::{
    ClientContext, ComponentConfigurer, DataInitializer, DataSynchronizer, DiagnosticsRecorder,
};
