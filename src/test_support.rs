//! Test doubles shared by unit tests.
use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{
    changeset::Change,
    destination::DataDestination,
    status::{DataSourceState, DataSourceStatusReporter, ErrorInfo},
    Selector,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DestinationCall {
    SetBasis(Vec<Change>, Selector, bool),
    ApplyDelta(Vec<Change>, Selector, bool),
}

/// Records every call made to it.
#[derive(Default)]
pub(crate) struct RecordingDestination {
    calls: Mutex<Vec<DestinationCall>>,
}

impl RecordingDestination {
    pub(crate) fn calls(&self) -> Vec<DestinationCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl DataDestination for RecordingDestination {
    fn set_basis(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(DestinationCall::SetBasis(changes, selector, persist));
        true
    }

    fn apply_delta(&self, changes: Vec<Change>, selector: Selector, persist: bool) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(DestinationCall::ApplyDelta(changes, selector, persist));
        true
    }
}

/// Records status updates and lets tests block until a matching update arrives.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    updates: Mutex<Vec<(DataSourceState, Option<ErrorInfo>)>>,
    changed: Condvar,
}

impl RecordingReporter {
    pub(crate) fn updates(&self) -> Vec<(DataSourceState, Option<ErrorInfo>)> {
        self.updates.lock().unwrap().clone()
    }

    /// Wait until an update satisfying `predicate` has been recorded.
    pub(crate) fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&(DataSourceState, Option<ErrorInfo>)) -> bool,
    ) -> Option<(DataSourceState, Option<ErrorInfo>)> {
        let deadline = Instant::now() + timeout;
        let mut updates = self.updates.lock().unwrap();
        loop {
            if let Some(update) = updates.iter().find(|update| predicate(update)) {
                return Some(update.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            updates = self.changed.wait_timeout(updates, deadline - now).unwrap().0;
        }
    }
}

impl DataSourceStatusReporter for RecordingReporter {
    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.updates.lock().unwrap().push((state, error));
        self.changed.notify_all();
    }
}
