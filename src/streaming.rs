//! Streaming synchronizer: keeps a server-sent events connection open and applies change sets as
//! they are completed.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{
    header::{ACCEPT, CACHE_CONTROL},
    Url,
};
use tokio::sync::watch;

use crate::{
    backoff::Backoff,
    changeset::{ChangeSetBuilder, IntentCode},
    destination::{apply_change_set, Basis, DataDestination},
    http::{
        check_if_error_is_recoverable_and_log, endpoint_url, http_error_description,
        STREAMING_REQUEST_PATH,
    },
    protocol::{known_kind, ProtocolEvent},
    status::{DataSourceState, DataSourceStatusReporter, ErrorInfo, ErrorKind},
    subsystems::{ClientContext, DataInitializer, DataSynchronizer, DiagnosticsRecorder},
    Error, ReadySignal, Result, Selector,
};

/// The server sends a heartbeat every few minutes; silence longer than this means the connection
/// is dead.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const STREAM_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const STREAM_RETRY_RESET_INTERVAL: Duration = Duration::from_secs(60);
const STREAM_JITTER_RATIO: f64 = 0.5;

const STREAMING_ERROR_CONTEXT: &str = "in stream connection";
const STREAMING_WILL_RETRY_MESSAGE: &str = "will retry";

/// Configuration for [`StreamProcessor`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base URI of the streaming service.
    pub base_uri: String,
    /// Delay before the first reconnect attempt. Later attempts back off exponentially.
    ///
    /// Defaults to [`StreamConfig::DEFAULT_INITIAL_RECONNECT_DELAY`].
    pub initial_reconnect_delay: Duration,
    /// Restricts the data set to a named filter.
    pub filter_key: Option<String>,
}

impl StreamConfig {
    /// Default value for [`StreamConfig::initial_reconnect_delay`].
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

    /// Create a configuration for `base_uri` with default settings.
    pub fn new(base_uri: impl Into<String>) -> StreamConfig {
        StreamConfig {
            base_uri: base_uri.into(),
            initial_reconnect_delay: StreamConfig::DEFAULT_INITIAL_RECONNECT_DELAY,
            filter_key: None,
        }
    }
}

/// What the connection loop must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Processed,
    /// The event could not be applied. Drop the connection and start again without a basis.
    Restart,
    /// The synchronizer was closed. Nothing was applied.
    Closed,
}

/// Start of the connection attempt currently in progress.
struct ConnectionAttempt {
    timestamp: DateTime<Utc>,
    started: Instant,
}

struct StreamShared {
    destination: Arc<dyn DataDestination>,
    status_reporter: Arc<dyn DataSourceStatusReporter>,
    diagnostics: Option<Arc<dyn DiagnosticsRecorder>>,
    initialized: AtomicBool,
    connection_attempt: Mutex<Option<ConnectionAttempt>>,
    /// Set by `close()`. Held while an event is applied and reported.
    closed: Mutex<bool>,
}

impl StreamShared {
    /// Run `f` unless the processor was closed. `close()` waits for `f` to finish, so nothing is
    /// applied or reported after the final `Off`.
    fn unless_closed<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let closed = match self.closed.lock() {
            Ok(closed) => closed,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *closed {
            return None;
        }
        Some(f())
    }

    fn report(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.unless_closed(|| self.status_reporter.update_status(state, error));
    }

    fn shut_down(&self) {
        let mut closed = match self.closed.lock() {
            Ok(closed) => closed,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*closed {
            *closed = true;
            self.status_reporter
                .update_status(DataSourceState::Off, None);
        }
    }

    fn connection_attempt_started(&self) {
        if let Ok(mut attempt) = self.connection_attempt.lock() {
            *attempt = Some(ConnectionAttempt {
                timestamp: Utc::now(),
                started: Instant::now(),
            });
        }
    }

    fn connection_attempt_ended(&self, failed: bool) {
        let Some(attempt) = self
            .connection_attempt
            .lock()
            .ok()
            .and_then(|mut attempt| attempt.take())
        else {
            return;
        };
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_stream_init(attempt.timestamp, failed, attempt.started.elapsed());
        }
    }
}

/// State owned by the connection loop.
struct StreamState {
    builder: ChangeSetBuilder,
    /// Selector sent as `basis` on the next connection.
    basis: Selector,
}

impl StreamState {
    fn new(basis: Selector) -> StreamState {
        StreamState {
            builder: ChangeSetBuilder::new(),
            basis,
        }
    }

    fn handle_event(
        &mut self,
        shared: &StreamShared,
        ready: &ReadySignal,
        name: &str,
        data: &str,
    ) -> EventOutcome {
        let outcome = shared.unless_closed(|| match self.apply_event(shared, ready, name, data) {
            Ok(()) => {
                shared
                    .status_reporter
                    .update_status(DataSourceState::Valid, None);
                EventOutcome::Processed
            }
            Err(err) => {
                log::error!(target: "flagsync", event = name; "received streaming event with malformed data: {}", err);
                self.builder.reset();
                self.basis = Selector::none();
                shared.status_reporter.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorKind::InvalidData, err.to_string())),
                );
                EventOutcome::Restart
            }
        });
        outcome.unwrap_or(EventOutcome::Closed)
    }

    fn apply_event(
        &mut self,
        shared: &StreamShared,
        ready: &ReadySignal,
        name: &str,
        data: &str,
    ) -> Result<()> {
        match ProtocolEvent::parse(name, data)? {
            ProtocolEvent::Heartbeat => {}
            ProtocolEvent::ServerIntent(intent) => {
                if intent.payload.intent_code == IntentCode::None {
                    log::info!(target: "flagsync", "server intent is none, data is up to date");
                    self.builder.up_to_date();
                    mark_initialized(shared, ready);
                } else {
                    self.builder.start(intent.payload.intent_code);
                }
            }
            ProtocolEvent::PutObject(put) => {
                if let Some(kind) = known_kind(&put.kind) {
                    self.builder
                        .add_put(kind, put.key, put.version, put.object)
                        .map_err(out_of_order)?;
                }
            }
            ProtocolEvent::DeleteObject(delete) => {
                if let Some(kind) = known_kind(&delete.kind) {
                    self.builder
                        .add_delete(kind, delete.key, delete.version)
                        .map_err(out_of_order)?;
                }
            }
            ProtocolEvent::Goodbye(goodbye) => {
                if !goodbye.silent {
                    log::error!(target: "flagsync", catastrophe = goodbye.catastrophe; "server is closing the stream: {}", goodbye.reason);
                }
            }
            ProtocolEvent::Error(error) => {
                log::warn!(target: "flagsync", payload_id = error.payload_id.as_str(); "server reported an error, discarding pending changes: {}", error.reason);
                self.builder.reset();
            }
            ProtocolEvent::PayloadTransferred(selector) => {
                let change_set = self.builder.finish(selector.clone()).map_err(out_of_order)?;
                apply_change_set(shared.destination.as_ref(), change_set, true);
                self.basis = selector;
                mark_initialized(shared, ready);
            }
            ProtocolEvent::Unknown(name) => {
                log::info!(target: "flagsync", "unexpected event found in stream: {}", name);
            }
        }
        Ok(())
    }
}

fn mark_initialized(shared: &StreamShared, ready: &ReadySignal) {
    if !shared.initialized.swap(true, Ordering::SeqCst) {
        log::info!(target: "flagsync", "stream initialized");
    }
    ready.fire();
}

fn out_of_order(err: Error) -> Error {
    match err {
        Error::NoServerIntent => {
            Error::MalformedData("event received before a server-intent".to_owned())
        }
        err => err,
    }
}

/// Build the stream request URL. The selector is sent as `basis` only when it is defined.
fn stream_url(base_uri: &str, basis: &Selector, filter_key: Option<&str>) -> Result<Url> {
    let mut params = Vec::new();
    if basis.is_defined() {
        params.push(("basis", basis.state()));
    }
    if let Some(filter) = filter_key {
        params.push(("filter", filter));
    }
    endpoint_url(base_uri, STREAMING_REQUEST_PATH, &params)
}

/// Resolves once `halt` is set, or once the sender is gone.
async fn halted(halt: &mut watch::Receiver<bool>) {
    while !*halt.borrow_and_update() {
        if halt.changed().await.is_err() {
            return;
        }
    }
}

/// The streaming synchronizer.
pub struct StreamProcessor {
    shared: Arc<StreamShared>,
    config: StreamConfig,
    client: reqwest::Client,
    halt: watch::Sender<bool>,
    started: AtomicBool,
    close_once: Once,
}

impl StreamProcessor {
    /// Create a streaming synchronizer.
    ///
    /// # Errors
    ///
    /// - [`Error::Network`] if the HTTP client cannot be created.
    pub fn new(context: &ClientContext, config: StreamConfig) -> Result<StreamProcessor> {
        let client = reqwest::Client::builder()
            .connect_timeout(context.http.connect_timeout)
            .default_headers(context.http.default_headers(&context.sdk_key))
            .build()?;
        let (halt, _) = watch::channel(false);

        Ok(StreamProcessor {
            shared: Arc::new(StreamShared {
                destination: context.destination.clone(),
                status_reporter: context.status_reporter.clone(),
                diagnostics: context.diagnostics.clone(),
                initialized: AtomicBool::new(false),
                connection_attempt: Mutex::new(None),
                closed: Mutex::new(false),
            }),
            config,
            client,
            halt,
            started: AtomicBool::new(false),
            close_once: Once::new(),
        })
    }

    /// Base URI of the streaming service.
    pub fn base_uri(&self) -> &str {
        &self.config.base_uri
    }

    /// Filter key, if any.
    pub fn filter_key(&self) -> Option<&str> {
        self.config.filter_key.as_deref()
    }
}

struct ConnectionLoop {
    shared: Arc<StreamShared>,
    config: StreamConfig,
    client: reqwest::Client,
    ready: ReadySignal,
    halt: watch::Receiver<bool>,
}

impl ConnectionLoop {
    async fn run(mut self, resume: Selector) {
        let mut backoff = Backoff::new(
            self.config.initial_reconnect_delay,
            STREAM_MAX_RETRY_DELAY,
            STREAM_JITTER_RATIO,
            STREAM_RETRY_RESET_INTERVAL,
        );
        let mut state = StreamState::new(resume);

        loop {
            if *self.halt.borrow() {
                return;
            }

            let url = match stream_url(
                &self.config.base_uri,
                &state.basis,
                self.config.filter_key.as_deref(),
            ) {
                Ok(url) => url,
                Err(err) => {
                    log::error!(target: "flagsync", "unable to create a stream request: {}", err);
                    self.shared.report(
                        DataSourceState::Off,
                        Some(ErrorInfo::new(ErrorKind::Unknown, err.to_string())),
                    );
                    self.ready.fire();
                    return;
                }
            };

            if !self.connect_and_consume(url, &mut state, &mut backoff).await {
                return;
            }

            let delay = backoff.next_delay();
            log::info!(target: "flagsync", delay:? = delay; "reconnecting to stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = halted(&mut self.halt) => return,
            }
        }
    }

    /// Run one connection. Returns `false` if the loop must stop.
    async fn connect_and_consume(
        &mut self,
        url: Url,
        state: &mut StreamState,
        backoff: &mut Backoff,
    ) -> bool {
        log::debug!(target: "flagsync", url = url.as_str(); "connecting to stream");
        self.shared.connection_attempt_started();

        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = tokio::select! {
            response = request => response,
            _ = halted(&mut self.halt) => return false,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.shared.connection_attempt_ended(true);
                let err = Error::from(err);
                check_if_error_is_recoverable_and_log(
                    &err.to_string(),
                    STREAMING_ERROR_CONTEXT,
                    None,
                    STREAMING_WILL_RETRY_MESSAGE,
                );
                self.shared.report(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(ErrorKind::NetworkError, err.to_string())),
                );
                return true;
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.shared.connection_attempt_ended(true);
            let status = status.as_u16();
            let recoverable = check_if_error_is_recoverable_and_log(
                &http_error_description(status),
                STREAMING_ERROR_CONTEXT,
                Some(status),
                STREAMING_WILL_RETRY_MESSAGE,
            );
            if recoverable {
                self.shared.report(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::error_response(status)),
                );
                return true;
            }
            self.shared
                .report(DataSourceState::Off, Some(ErrorInfo::error_response(status)));
            self.ready.fire();
            return false;
        }

        self.shared.connection_attempt_ended(false);
        backoff.mark_good();

        let mut events = response.bytes_stream().eventsource();
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(STREAM_READ_TIMEOUT, events.next()) => next,
                _ = halted(&mut self.halt) => return false,
            };

            let message = match next {
                Err(_elapsed) => "stream read timed out".to_owned(),
                Ok(None) => "stream closed by server".to_owned(),
                Ok(Some(Err(err))) => err.to_string(),
                Ok(Some(Ok(event))) => {
                    match state.handle_event(&self.shared, &self.ready, &event.event, &event.data) {
                        EventOutcome::Processed => continue,
                        EventOutcome::Restart => return true,
                        EventOutcome::Closed => return false,
                    }
                }
            };

            log::warn!(target: "flagsync", "Error {STREAMING_ERROR_CONTEXT}: {message}; {STREAMING_WILL_RETRY_MESSAGE}");
            self.shared.report(
                DataSourceState::Interrupted,
                Some(ErrorInfo::new(ErrorKind::NetworkError, message)),
            );
            return true;
        }
    }
}

impl DataInitializer for StreamProcessor {
    fn name(&self) -> &'static str {
        "StreamingDataSourceV2"
    }

    fn fetch(&self) -> Result<Basis> {
        Err(Error::FetchNotSupported("streaming"))
    }
}

impl DataSynchronizer for StreamProcessor {
    fn name(&self) -> &'static str {
        "StreamingDataSourceV2"
    }

    fn sync(&self, ready: ReadySignal, selector: Selector) {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!(target: "flagsync", "streaming synchronizer was already started");
            return;
        }

        log::info!(target: "flagsync", base_uri = self.config.base_uri.as_str(); "starting stream");

        let connection = ConnectionLoop {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            client: self.client.clone(),
            ready: ready.clone(),
            halt: self.halt.subscribe(),
        };
        let shared = Arc::clone(&self.shared);

        let spawned = std::thread::Builder::new()
            .name("flagsync-stream".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            log::error!(target: "flagsync", "failed to start stream runtime: {}", err);
                            shared.report(
                                DataSourceState::Off,
                                Some(ErrorInfo::new(ErrorKind::Unknown, err.to_string())),
                            );
                            return;
                        }
                    };

                    runtime.block_on(connection.run(selector));
                }));

                if result.is_err() {
                    log::error!(target: "flagsync", "stream thread panicked");
                    shared.report(
                        DataSourceState::Off,
                        Some(ErrorInfo::new(ErrorKind::Unknown, Error::ThreadPanicked.to_string())),
                    );
                }
                // Stop waiting for initialization if we exit, even if initialization failed.
                ready.fire();
            });

        if let Err(err) = spawned {
            log::error!(target: "flagsync", "failed to start stream thread: {}", err);
            self.shared.report(
                DataSourceState::Off,
                Some(ErrorInfo::new(ErrorKind::Unknown, err.to_string())),
            );
        }
    }

    fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_once.call_once(|| {
            self.halt.send_replace(true);
            self.shared.shut_down();
        });
    }
}
