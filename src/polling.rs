//! Polling synchronizer: periodically requests the full data set or the changes since the last
//! request.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError},
        Arc, Mutex, Once,
    },
    time::Duration,
};

use reqwest::{
    header::{ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};

use crate::{
    changeset::{ChangeSet, ChangeSetBuilder, IntentCode},
    destination::{apply_change_set, Basis, DataDestination},
    http::{
        check_if_error_is_recoverable_and_log, endpoint_url, http_error_description,
        POLLING_REQUEST_PATH,
    },
    protocol::PollingPayload,
    status::{DataSourceState, DataSourceStatusReporter, ErrorInfo, ErrorKind},
    subsystems::{ClientContext, DataInitializer, DataSynchronizer},
    Error, ReadySignal, Result, Selector,
};

const POLLING_ERROR_CONTEXT: &str = "on polling request";
const POLLING_WILL_RETRY_MESSAGE: &str = "will retry at next scheduled poll interval";

/// Performs a single polling request. Lets [`PollingProcessor`] be tested without a server.
pub trait PollingRequester: Send + Sync {
    /// Request the current data. Fails with [`Error::HttpStatus`] for error responses and
    /// [`Error::MalformedData`] for bodies that cannot be decoded.
    fn request(&self) -> Result<ChangeSet>;

    /// Base URI requests are sent to.
    fn base_uri(&self) -> &str;

    /// Filter applied to the data set, if any.
    fn filter_key(&self) -> Option<&str>;
}

/// [`PollingRequester`] that talks to the polling endpoint over HTTP.
pub struct HttpPollingRequester {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    base_uri: String,
    filter_key: Option<String>,
    /// ETag of the last successful response. Sent back so an unchanged data set costs a `304`.
    etag: Mutex<Option<String>>,
}

impl HttpPollingRequester {
    /// Create a requester for `base_uri`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUri`] if `base_uri` is not a valid URI.
    /// - [`Error::Network`] if the HTTP client cannot be created.
    pub fn new(
        context: &ClientContext,
        base_uri: impl Into<String>,
        filter_key: Option<String>,
    ) -> Result<HttpPollingRequester> {
        let base_uri = base_uri.into();
        let params: Vec<(&str, &str)> = filter_key
            .as_deref()
            .map(|filter| ("filter", filter))
            .into_iter()
            .collect();
        let url = endpoint_url(&base_uri, POLLING_REQUEST_PATH, &params)?;

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(context.http.connect_timeout)
            .default_headers(context.http.default_headers(&context.sdk_key))
            .build()?;

        Ok(HttpPollingRequester {
            client,
            url,
            base_uri,
            filter_key,
            etag: Mutex::new(None),
        })
    }

    fn cached_etag(&self) -> Option<String> {
        self.etag.lock().ok()?.clone()
    }

    fn cache_etag(&self, etag: Option<String>) {
        if let Ok(mut slot) = self.etag.lock() {
            *slot = etag;
        }
    }
}

impl PollingRequester for HttpPollingRequester {
    fn request(&self) -> Result<ChangeSet> {
        let mut request = self.client.get(self.url.clone());
        if let Some(etag) = self.cached_etag() {
            request = request.header(IF_NONE_MATCH, etag);
        }

        log::debug!(target: "flagsync", url = self.url.as_str(); "polling for data");
        let response = request.send()?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            log::debug!(target: "flagsync", "data has not changed since the last poll");
            return Ok(ChangeSetBuilder::no_changes());
        }
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text()?;

        let change_set = PollingPayload::parse(&body)?.into_change_set()?;
        self.cache_etag(etag);

        Ok(change_set)
    }

    fn base_uri(&self) -> &str {
        &self.base_uri
    }

    fn filter_key(&self) -> Option<&str> {
        self.filter_key.as_deref()
    }
}

struct PollingShared {
    destination: Arc<dyn DataDestination>,
    status_reporter: Arc<dyn DataSourceStatusReporter>,
    requester: Arc<dyn PollingRequester>,
    initialized: AtomicBool,
    /// Set by `close()`. Held while a poll result is applied and reported.
    closed: Mutex<bool>,
}

/// The polling synchronizer. Also usable as an initializer through [`DataInitializer::fetch`].
pub struct PollingProcessor {
    shared: Arc<PollingShared>,
    poll_interval: Duration,
    /// Used to send a stop command to the poller thread.
    stop_sender: SyncSender<()>,
    /// Taken by the poller thread when it starts.
    stop_receiver: Mutex<Option<Receiver<()>>>,
    close_once: Once,
}

impl PollingProcessor {
    /// Create a polling synchronizer that uses `requester` every `poll_interval`.
    pub fn new(
        context: &ClientContext,
        requester: Arc<dyn PollingRequester>,
        poll_interval: Duration,
    ) -> PollingProcessor {
        // Buffer size of 1 is enough: `close()` sends a single stop command.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        PollingProcessor {
            shared: Arc::new(PollingShared {
                destination: context.destination.clone(),
                status_reporter: context.status_reporter.clone(),
                requester,
                initialized: AtomicBool::new(false),
                closed: Mutex::new(false),
            }),
            poll_interval,
            stop_sender,
            stop_receiver: Mutex::new(Some(stop_receiver)),
            close_once: Once::new(),
        }
    }

    /// Configured poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Base URI of the requester.
    pub fn base_uri(&self) -> &str {
        self.shared.requester.base_uri()
    }

    /// Filter key of the requester.
    pub fn filter_key(&self) -> Option<&str> {
        self.shared.requester.filter_key()
    }
}

impl PollingShared {
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

    /// Apply a successful poll result.
    fn accept(&self, ready: &ReadySignal, change_set: ChangeSet) {
        apply_change_set(self.destination.as_ref(), change_set, true);
        self.status_reporter
            .update_status(DataSourceState::Valid, None);
        if !self.initialized.swap(true, Ordering::SeqCst) {
            log::info!(target: "flagsync", "first polling request successful");
        }
        ready.fire();
    }

    /// Report a failed poll. Returns `false` if polling must stop.
    fn handle_error(&self, err: Error) -> bool {
        match err {
            Error::HttpStatus(status) => {
                let recoverable = check_if_error_is_recoverable_and_log(
                    &http_error_description(status),
                    POLLING_ERROR_CONTEXT,
                    Some(status),
                    POLLING_WILL_RETRY_MESSAGE,
                );
                let state = if recoverable {
                    DataSourceState::Interrupted
                } else {
                    DataSourceState::Off
                };
                self.status_reporter
                    .update_status(state, Some(ErrorInfo::error_response(status)));
                recoverable
            }
            err => {
                let kind = match err {
                    Error::MalformedData(_) => ErrorKind::InvalidData,
                    _ => ErrorKind::NetworkError,
                };
                check_if_error_is_recoverable_and_log(
                    &err.to_string(),
                    POLLING_ERROR_CONTEXT,
                    None,
                    POLLING_WILL_RETRY_MESSAGE,
                );
                self.status_reporter.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::new(kind, err.to_string())),
                );
                true
            }
        }
    }

    fn run(&self, ready: &ReadySignal, stop_receiver: Receiver<()>, poll_interval: Duration) {
        loop {
            match stop_receiver.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }

            let result = self.requester.request();
            let keep_polling = self.unless_closed(|| match result {
                Ok(change_set) => {
                    self.accept(ready, change_set);
                    true
                }
                Err(err) => self.handle_error(err),
            });
            match keep_polling {
                Some(true) => {}
                Some(false) => return,
                None => {
                    log::debug!(target: "flagsync", "discarding poll result received after close");
                    return;
                }
            }

            match stop_receiver.recv_timeout(poll_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    // Timed out. Loop back to poll again.
                }
                Ok(()) => {
                    log::debug!(target: "flagsync", "poller thread received stop command");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(target: "flagsync", "poller thread received disconnected");
                    return;
                }
            }
        }
    }
}

impl DataInitializer for PollingProcessor {
    fn name(&self) -> &'static str {
        "PollingDataSourceV2"
    }

    fn fetch(&self) -> Result<Basis> {
        let change_set = self.shared.requester.request()?;
        if change_set.intent_code() == IntentCode::None {
            return Err(Error::MalformedData(
                "server did not send a payload for a full fetch".to_owned(),
            ));
        }
        let (_, changes, selector) = change_set.into_parts();
        Ok(Basis {
            changes,
            selector,
            persist: true,
        })
    }
}

impl DataSynchronizer for PollingProcessor {
    fn name(&self) -> &'static str {
        "PollingDataSourceV2"
    }

    fn sync(&self, ready: ReadySignal, _selector: Selector) {
        let Some(stop_receiver) = self.stop_receiver.lock().ok().and_then(|mut slot| slot.take())
        else {
            log::warn!(target: "flagsync", "polling synchronizer was already started");
            return;
        };

        log::info!(target: "flagsync", interval:? = self.poll_interval; "starting polling");

        let shared = Arc::clone(&self.shared);
        let poll_interval = self.poll_interval;
        let spawned = std::thread::Builder::new()
            .name("flagsync-poller".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    shared.run(&ready, stop_receiver, poll_interval)
                }));

                if result.is_err() {
                    log::error!(target: "flagsync", "poller thread panicked");
                    shared.status_reporter.update_status(
                        DataSourceState::Off,
                        Some(ErrorInfo::new(ErrorKind::Unknown, Error::ThreadPanicked.to_string())),
                    );
                }
                // Stop waiting for initialization if we exit, even if initialization failed.
                ready.fire();
            });

        if let Err(err) = spawned {
            log::error!(target: "flagsync", "failed to start poller thread: {}", err);
            self.shared.status_reporter.update_status(
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
            // Error means that the thread already exited or a stop command is already queued.
            let _ = self.stop_sender.try_send(());
            self.shared.shut_down();
        });
    }
}
