//! Declarative configuration of the data system: which store, initializers and synchronizers to
//! use, and in which roles.
use std::{sync::Arc, time::Duration};

use crate::{
    polling::{HttpPollingRequester, PollingProcessor},
    store::{DataStore, DataStoreMode},
    streaming::{StreamConfig, StreamProcessor},
    subsystems::{ClientContext, ComponentConfigurer, DataInitializer, DataSynchronizer},
    Error, Result,
};

/// Default base URI of the streaming service.
pub const DEFAULT_STREAMING_BASE_URI: &str = "https://stream.launchdarkly.com";
/// Default base URI of the polling service.
pub const DEFAULT_POLLING_BASE_URI: &str = "https://sdk.launchdarkly.com";

/// Builds a data store.
pub type DataStoreConfigurer = Arc<dyn ComponentConfigurer<Arc<dyn DataStore>>>;
/// Builds an initializer.
pub type InitializerConfigurer = Arc<dyn ComponentConfigurer<Arc<dyn DataInitializer>>>;
/// Builds a synchronizer.
pub type SynchronizerConfigurer = Arc<dyn ComponentConfigurer<Arc<dyn DataSynchronizer>>>;

/// An already constructed store configures itself.
impl ComponentConfigurer<Arc<dyn DataStore>> for Arc<dyn DataStore> {
    fn build(&self, _context: &ClientContext) -> Result<Arc<dyn DataStore>> {
        Ok(Arc::clone(self))
    }
}

/// Configuration for the streaming synchronizer.
///
/// ```
/// # use std::time::Duration;
/// # use flagsync::StreamingDataSourceBuilder;
/// let streaming = StreamingDataSourceBuilder::new()
///     .initial_reconnect_delay(Duration::from_millis(500))
///     .filter("mobile");
/// ```
#[derive(Debug, Clone)]
pub struct StreamingDataSourceBuilder {
    config: StreamConfig,
}

impl StreamingDataSourceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> StreamingDataSourceBuilder {
        StreamingDataSourceBuilder {
            config: StreamConfig::new(DEFAULT_STREAMING_BASE_URI),
        }
    }

    /// Override the base URI of the streaming service.
    pub fn base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.config.base_uri = base_uri.into();
        self
    }

    /// Delay before the first reconnect attempt.
    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.initial_reconnect_delay = delay;
        self
    }

    /// Restrict the data set to a named filter.
    pub fn filter(mut self, filter_key: impl Into<String>) -> Self {
        self.config.filter_key = Some(filter_key.into());
        self
    }
}

impl Default for StreamingDataSourceBuilder {
    fn default() -> Self {
        StreamingDataSourceBuilder::new()
    }
}

impl ComponentConfigurer<Arc<dyn DataSynchronizer>> for StreamingDataSourceBuilder {
    fn build(&self, context: &ClientContext) -> Result<Arc<dyn DataSynchronizer>> {
        Ok(Arc::new(StreamProcessor::new(context, self.config.clone())?))
    }
}

/// Configuration for the polling synchronizer.
#[derive(Debug, Clone)]
pub struct PollingDataSourceBuilder {
    base_uri: String,
    poll_interval: Duration,
    filter_key: Option<String>,
}

impl PollingDataSourceBuilder {
    /// Default poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Shortest poll interval accepted by [`PollingDataSourceBuilder::poll_interval`].
    pub const MINIMUM_POLL_INTERVAL: Duration = Duration::from_secs(30);

    /// Create a builder with default settings.
    pub fn new() -> PollingDataSourceBuilder {
        PollingDataSourceBuilder {
            base_uri: DEFAULT_POLLING_BASE_URI.to_owned(),
            poll_interval: PollingDataSourceBuilder::DEFAULT_POLL_INTERVAL,
            filter_key: None,
        }
    }

    /// Override the base URI of the polling service.
    pub fn base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.base_uri = base_uri.into();
        self
    }

    /// Time between polls. Values below [`PollingDataSourceBuilder::MINIMUM_POLL_INTERVAL`] are
    /// raised to the minimum.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        if poll_interval < PollingDataSourceBuilder::MINIMUM_POLL_INTERVAL {
            log::warn!(target: "flagsync", requested:? = poll_interval; "poll interval is below the minimum, using the minimum");
            self.poll_interval = PollingDataSourceBuilder::MINIMUM_POLL_INTERVAL;
        } else {
            self.poll_interval = poll_interval;
        }
        self
    }

    /// Restrict the data set to a named filter.
    pub fn filter(mut self, filter_key: impl Into<String>) -> Self {
        self.filter_key = Some(filter_key.into());
        self
    }

    /// Use polling as a one-shot initializer instead of a synchronizer.
    pub fn as_initializer(&self) -> PollingInitializerBuilder {
        PollingInitializerBuilder {
            polling: self.clone(),
        }
    }

    fn build_processor(&self, context: &ClientContext) -> Result<PollingProcessor> {
        let requester =
            HttpPollingRequester::new(context, self.base_uri.clone(), self.filter_key.clone())?;
        Ok(PollingProcessor::new(
            context,
            Arc::new(requester),
            self.poll_interval,
        ))
    }
}

impl Default for PollingDataSourceBuilder {
    fn default() -> Self {
        PollingDataSourceBuilder::new()
    }
}

impl ComponentConfigurer<Arc<dyn DataSynchronizer>> for PollingDataSourceBuilder {
    fn build(&self, context: &ClientContext) -> Result<Arc<dyn DataSynchronizer>> {
        Ok(Arc::new(self.build_processor(context)?))
    }
}

/// Polling configured as an initializer. See [`PollingDataSourceBuilder::as_initializer`].
#[derive(Debug, Clone)]
pub struct PollingInitializerBuilder {
    polling: PollingDataSourceBuilder,
}

impl ComponentConfigurer<Arc<dyn DataInitializer>> for PollingInitializerBuilder {
    fn build(&self, context: &ClientContext) -> Result<Arc<dyn DataInitializer>> {
        Ok(Arc::new(self.polling.build_processor(context)?))
    }
}

/// Base URIs of the streaming and polling services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Base URI of the streaming service.
    pub streaming: String,
    /// Base URI of the polling service.
    pub polling: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            streaming: DEFAULT_STREAMING_BASE_URI.to_owned(),
            polling: DEFAULT_POLLING_BASE_URI.to_owned(),
        }
    }
}

/// Ready-made data acquisition strategies.
///
/// ```
/// # use flagsync::DataSystemModes;
/// let builder = DataSystemModes::new()
///     .with_relay_proxy_endpoints("http://localhost:8123")
///     .default_mode();
/// ```
#[derive(Debug, Clone, Default)]
pub struct DataSystemModes {
    endpoints: Endpoints,
}

impl DataSystemModes {
    /// Modes using the default endpoints.
    pub fn new() -> DataSystemModes {
        DataSystemModes::default()
    }

    /// Use custom endpoints. An empty string keeps the current endpoint for that service.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        if !endpoints.streaming.is_empty() {
            self.endpoints.streaming = endpoints.streaming;
        }
        if !endpoints.polling.is_empty() {
            self.endpoints.polling = endpoints.polling;
        }
        self
    }

    /// Send both streaming and polling requests to a relay proxy at `base_uri`.
    pub fn with_relay_proxy_endpoints(self, base_uri: impl Into<String>) -> Self {
        let base_uri = base_uri.into();
        self.with_endpoints(Endpoints {
            streaming: base_uri.clone(),
            polling: base_uri,
        })
    }

    fn streaming_builder(&self) -> StreamingDataSourceBuilder {
        StreamingDataSourceBuilder::new().base_uri(self.endpoints.streaming.clone())
    }

    fn polling_builder(&self) -> PollingDataSourceBuilder {
        PollingDataSourceBuilder::new().base_uri(self.endpoints.polling.clone())
    }

    /// The recommended strategy: fetch a full snapshot by polling once, then stream updates,
    /// falling back to polling if streaming stays unavailable.
    pub fn default_mode(&self) -> DataSystemConfigurationBuilder {
        let polling = self.polling_builder();
        self.custom()
            .initializers(vec![Arc::new(polling.as_initializer())])
            .synchronizers(
                Some(Arc::new(self.streaming_builder())),
                Some(Arc::new(polling)),
            )
    }

    /// Stream updates, with no initializer and no fallback.
    pub fn streaming(&self) -> DataSystemConfigurationBuilder {
        self.custom()
            .synchronizers(Some(Arc::new(self.streaming_builder())), None)
    }

    /// Poll for updates, with no initializer and no fallback.
    pub fn polling(&self) -> DataSystemConfigurationBuilder {
        self.custom()
            .synchronizers(Some(Arc::new(self.polling_builder())), None)
    }

    /// Only read from a persistent store populated by another process. Never connects to the
    /// service and never writes to the store.
    pub fn daemon(&self, store: DataStoreConfigurer) -> DataSystemConfigurationBuilder {
        self.custom().data_store(store, DataStoreMode::Read)
    }

    /// The default strategy, serving from `store` until fresh data arrives and keeping it up to
    /// date afterwards.
    pub fn persistent_store(&self, store: DataStoreConfigurer) -> DataSystemConfigurationBuilder {
        self.default_mode()
            .data_store(store, DataStoreMode::ReadWrite)
    }

    /// An empty builder for a custom strategy.
    pub fn custom(&self) -> DataSystemConfigurationBuilder {
        DataSystemConfigurationBuilder::new()
    }
}

/// Builds a [`DataSystemConfiguration`].
#[derive(Clone, Default)]
pub struct DataSystemConfigurationBuilder {
    store: Option<DataStoreConfigurer>,
    store_mode: DataStoreMode,
    initializers: Vec<InitializerConfigurer>,
    primary: Option<SynchronizerConfigurer>,
    secondary: Option<SynchronizerConfigurer>,
}

impl DataSystemConfigurationBuilder {
    /// Create an empty builder.
    pub fn new() -> DataSystemConfigurationBuilder {
        DataSystemConfigurationBuilder::default()
    }

    /// Use a persistent store in `mode`.
    pub fn data_store(mut self, store: DataStoreConfigurer, mode: DataStoreMode) -> Self {
        self.store = Some(store);
        self.store_mode = mode;
        self
    }

    /// Initializers, run in order until one returns data.
    pub fn initializers(mut self, initializers: Vec<InitializerConfigurer>) -> Self {
        self.initializers = initializers;
        self
    }

    /// Primary synchronizer, and the secondary the data system falls back to.
    pub fn synchronizers(
        mut self,
        primary: Option<SynchronizerConfigurer>,
        secondary: Option<SynchronizerConfigurer>,
    ) -> Self {
        self.primary = primary;
        self.secondary = secondary;
        self
    }

    /// Construct every configured component.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if a secondary synchronizer is set without a primary. Nothing is
    ///   constructed in that case.
    /// - The error of the first component that fails to build. Components are built in the order
    ///   store, initializers, primary, secondary.
    pub fn build(&self, context: &ClientContext) -> Result<DataSystemConfiguration> {
        if self.secondary.is_some() && self.primary.is_none() {
            return Err(Error::Configuration(
                "cannot have a secondary synchronizer without a primary synchronizer".to_owned(),
            ));
        }

        let store = self
            .store
            .as_ref()
            .map(|store| store.build(context))
            .transpose()?;

        let initializers = self
            .initializers
            .iter()
            .map(|initializer| initializer.build(context))
            .collect::<Result<Vec<_>>>()?;

        let primary = self
            .primary
            .as_ref()
            .map(|primary| primary.build(context))
            .transpose()?;
        let secondary = self
            .secondary
            .as_ref()
            .map(|secondary| secondary.build(context))
            .transpose()?;

        Ok(DataSystemConfiguration {
            store,
            store_mode: self.store_mode,
            initializers,
            synchronizers: SynchronizersConfiguration { primary, secondary },
        })
    }
}

/// Primary and secondary synchronizers.
#[derive(Clone, Default)]
pub struct SynchronizersConfiguration {
    /// Synchronizer started after initialization.
    pub primary: Option<Arc<dyn DataSynchronizer>>,
    /// Synchronizer used when the primary stays unavailable.
    pub secondary: Option<Arc<dyn DataSynchronizer>>,
}

/// Constructed components of the data system.
#[derive(Clone, Default)]
pub struct DataSystemConfiguration {
    /// Persistent store, if any.
    pub store: Option<Arc<dyn DataStore>>,
    /// How the persistent store may be used.
    pub store_mode: DataStoreMode,
    /// Initializers, in the order they are tried.
    pub initializers: Vec<Arc<dyn DataInitializer>>,
    /// Primary and secondary synchronizers.
    pub synchronizers: SynchronizersConfiguration,
}
