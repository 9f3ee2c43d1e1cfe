//! The data system runtime: runs initializers, then keeps data up to date with the primary
//! synchronizer, falling back to the secondary when the primary stays unavailable.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, Once,
    },
    time::Duration,
};

use chrono::Utc;

use crate::{
    config::{DataSystemConfiguration, DataSystemConfigurationBuilder},
    destination::{DataDestination, StoreDestination},
    http::HttpConfig,
    status::{DataSourceState, DataSourceStatus, DataSourceStatusTracker},
    subsystems::{ClientContext, DataSynchronizer, DiagnosticsRecorder},
    Error, ReadySignal, Result,
};

/// Settings for starting a [`DataSystem`].
#[derive(Clone)]
pub struct DataSystemConfig {
    sdk_key: String,
    http: HttpConfig,
    diagnostics: Option<Arc<dyn DiagnosticsRecorder>>,
    fallback_after: Duration,
    monitor_interval: Duration,
}

impl DataSystemConfig {
    /// How long the primary synchronizer may stay unavailable before falling back to the
    /// secondary.
    pub const DEFAULT_FALLBACK_AFTER: Duration = Duration::from_secs(2 * 60);
    /// How often the primary synchronizer's status is checked.
    pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

    /// Create settings for `sdk_key` with defaults.
    ///
    /// ```
    /// # use flagsync::DataSystemConfig;
    /// DataSystemConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> DataSystemConfig {
        DataSystemConfig {
            sdk_key: sdk_key.into(),
            http: HttpConfig::default(),
            diagnostics: None,
            fallback_after: DataSystemConfig::DEFAULT_FALLBACK_AFTER,
            monitor_interval: DataSystemConfig::DEFAULT_MONITOR_INTERVAL,
        }
    }

    /// Override HTTP settings.
    pub fn http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    /// Report stream connection timing to `diagnostics`.
    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsRecorder>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Override how long the primary synchronizer may stay unavailable.
    pub fn fallback_after(mut self, fallback_after: Duration) -> Self {
        self.fallback_after = fallback_after;
        self
    }

    /// Override how often the primary synchronizer's status is checked.
    pub fn monitor_interval(mut self, monitor_interval: Duration) -> Self {
        self.monitor_interval = monitor_interval;
        self
    }

    /// Build every component described by `builder` and start the data system.
    ///
    /// # Errors
    ///
    /// - Any error from [`DataSystemConfigurationBuilder::build`].
    /// - [`Error::Io`] if the background thread cannot be started.
    pub fn start(self, builder: &DataSystemConfigurationBuilder) -> Result<DataSystem> {
        let tracker = Arc::new(DataSourceStatusTracker::new());
        let destination = Arc::new(StoreDestination::new(tracker.clone()));

        let mut context = ClientContext::new(self.sdk_key.clone(), destination.clone(), tracker.clone())
            .with_http(self.http.clone());
        if let Some(diagnostics) = &self.diagnostics {
            context = context.with_diagnostics(diagnostics.clone());
        }

        let configuration = builder.build(&context)?;
        DataSystem::start(configuration, destination, tracker, &self)
    }
}

struct Shared {
    destination: Arc<StoreDestination>,
    tracker: Arc<DataSourceStatusTracker>,
    ready: ReadySignal,
    closed: AtomicBool,
    /// The synchronizer currently driving updates.
    active: Mutex<Option<Arc<dyn DataSynchronizer>>>,
}

/// A running data system.
///
/// Dropping it does not stop background work; call [`DataSystem::close`].
pub struct DataSystem {
    shared: Arc<Shared>,
    stop_sender: SyncSender<()>,
    close_once: Once,
}

impl DataSystem {
    fn start(
        configuration: DataSystemConfiguration,
        destination: Arc<StoreDestination>,
        tracker: Arc<DataSourceStatusTracker>,
        config: &DataSystemConfig,
    ) -> Result<DataSystem> {
        if let Some(store) = &configuration.store {
            destination.attach_persistent_store(store.clone(), configuration.store_mode);
        }

        let shared = Arc::new(Shared {
            destination,
            tracker,
            ready: ReadySignal::new(),
            closed: AtomicBool::new(false),
            active: Mutex::new(None),
        });
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        {
            let shared = Arc::clone(&shared);
            let fallback_after = config.fallback_after;
            let monitor_interval = config.monitor_interval;
            std::thread::Builder::new()
                .name("flagsync-data-system".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        shared.run(configuration, &stop_receiver, fallback_after, monitor_interval)
                    }));
                    if result.is_err() {
                        log::error!(target: "flagsync", "{}", Error::ThreadPanicked);
                        shared.ready.fire();
                    }
                })?;
        }

        Ok(DataSystem {
            shared,
            stop_sender,
            close_once: Once::new(),
        })
    }

    /// Block until data is available or every source has failed permanently, at most `timeout`.
    /// Returns whether the data system became ready.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        self.shared.ready.wait_timeout(timeout)
    }

    /// Returns `true` once the data system is ready.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_ready()
    }

    /// Current status of the data source.
    pub fn status(&self) -> DataSourceStatus {
        self.shared.tracker.status()
    }

    /// Subscribe to status changes.
    pub fn status_listener(&self) -> Receiver<DataSourceStatus> {
        self.shared.tracker.add_listener()
    }

    /// Read access to the data.
    pub fn store(&self) -> &StoreDestination {
        &self.shared.destination
    }

    /// Stop the active synchronizer and the background thread. Idempotent.
    pub fn close(&self) {
        self.close_once.call_once(|| {
            log::debug!(target: "flagsync", "closing data system");
            self.shared.closed.store(true, Ordering::SeqCst);
            // Error means that the thread already exited or a stop command is already queued.
            let _ = self.stop_sender.try_send(());
            if let Some(active) = self.shared.take_active() {
                active.close();
            }
            // Nothing will load data anymore.
            self.shared.ready.fire();
        });
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_active(&self) -> Option<Arc<dyn DataSynchronizer>> {
        match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Start `synchronizer` and make it the active one. Does nothing once closed.
    fn activate(&self, synchronizer: Arc<dyn DataSynchronizer>) -> bool {
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_closed() {
            return false;
        }
        if let Some(previous) = active.take() {
            previous.close();
        }
        log::info!(target: "flagsync", synchronizer = synchronizer.name(); "starting synchronizer");
        synchronizer.sync(self.ready.clone(), self.destination.selector());
        *active = Some(synchronizer);
        true
    }

    fn run_initializers(&self, configuration: &DataSystemConfiguration) -> bool {
        for initializer in &configuration.initializers {
            if self.is_closed() {
                return false;
            }
            match initializer.fetch() {
                Ok(basis) => {
                    log::info!(target: "flagsync", initializer = initializer.name(); "initialized data");
                    self.destination
                        .set_basis(basis.changes, basis.selector, basis.persist);
                    return true;
                }
                Err(err) => {
                    log::warn!(target: "flagsync", initializer = initializer.name(); "initializer failed: {}", err);
                }
            }
        }
        false
    }

    fn run(
        &self,
        configuration: DataSystemConfiguration,
        stop_receiver: &Receiver<()>,
        fallback_after: Duration,
        monitor_interval: Duration,
    ) {
        let synchronizers = configuration.synchronizers.clone();

        if configuration.initializers.is_empty() && synchronizers.primary.is_none() {
            log::info!(target: "flagsync", "no data sources configured, serving from the data store only");
            self.ready.fire();
            return;
        }

        if self.run_initializers(&configuration) {
            self.ready.fire();
        }

        let Some(primary) = synchronizers.primary else {
            // Nothing else will ever provide data.
            self.ready.fire();
            return;
        };
        if !self.activate(primary) {
            return;
        }
        let primary_started = Utc::now();

        let Some(secondary) = synchronizers.secondary else {
            return;
        };

        loop {
            match stop_receiver.recv_timeout(monitor_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }

            let status = self.tracker.status();
            if should_fall_back(&status, primary_started, fallback_after) {
                log::warn!(target: "flagsync", state:serde = status.state; "primary synchronizer is unavailable, falling back to secondary");
                self.activate(secondary);
                return;
            }
        }
    }
}

/// Whether the primary synchronizer has been unavailable for too long.
fn should_fall_back(
    status: &DataSourceStatus,
    primary_started: chrono::DateTime<Utc>,
    fallback_after: Duration,
) -> bool {
    match status.state {
        DataSourceState::Off => true,
        DataSourceState::Valid => false,
        DataSourceState::Initializing | DataSourceState::Interrupted => {
            let since = status.state_since.max(primary_started);
            Utc::now()
                .signed_duration_since(since)
                .to_std()
                .is_ok_and(|unavailable| unavailable >= fallback_after)
        }
    }
}
