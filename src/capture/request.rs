// SPDX-License-Identifier: GPL-3.0-only

//! Capture requests owned by the engine

use crate::backends::camera::controls::ControlList;
use crate::backends::camera::types::{BufferId, RequestSubmission, StreamId};
use std::collections::BTreeMap;

/// Where a request is in its lifecycle
///
/// Cancellation and recycling are transitions rather than resting states:
/// a cancelled request goes straight back to `Idle`, and a recycled one
/// goes from `Completed` to `Submitted` (or `Idle` once the session stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Buffers bound, no controls, not queued
    Idle,
    /// Queued on the backend
    Submitted,
    /// Backing a completed frame that someone still holds
    Completed,
}

/// One exposure's worth of buffers plus the controls it was queued with
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    cookie: u64,
    buffers: BTreeMap<StreamId, BufferId>,
    controls: ControlList,
    state: RequestState,
    /// Sequence of the frame this request currently backs
    sequence: Option<u64>,
}

impl CaptureRequest {
    pub(crate) fn new(cookie: u64, buffers: BTreeMap<StreamId, BufferId>) -> Self {
        Self {
            cookie,
            buffers,
            controls: ControlList::new(),
            state: RequestState::Idle,
            sequence: None,
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn buffers(&self) -> &BTreeMap<StreamId, BufferId> {
        &self.buffers
    }

    /// Queue-ready copy of this request carrying `controls`
    pub(crate) fn submit(&mut self, controls: ControlList) -> RequestSubmission {
        self.controls = controls;
        self.state = RequestState::Submitted;
        self.sequence = None;
        RequestSubmission {
            cookie: self.cookie,
            buffers: self.buffers.clone(),
            controls: self.controls.clone(),
        }
    }

    pub(crate) fn complete(&mut self, sequence: u64) {
        self.state = RequestState::Completed;
        self.sequence = Some(sequence);
    }

    /// Back to `Idle` with the given buffers reattached
    pub(crate) fn reuse(&mut self, buffers: BTreeMap<StreamId, BufferId>) {
        self.buffers = buffers;
        self.controls.clear();
        self.state = RequestState::Idle;
        self.sequence = None;
    }

    /// Back to `Idle` keeping the current buffers
    pub(crate) fn reset(&mut self) {
        self.controls.clear();
        self.state = RequestState::Idle;
        self.sequence = None;
    }

    /// Whether this request currently backs the frame with `sequence`
    pub(crate) fn backs(&self, sequence: u64) -> bool {
        self.state == RequestState::Completed && self.sequence == Some(sequence)
    }
}

/// Request states summed over the whole set, for conservation checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub idle: usize,
    pub submitted: usize,
    pub completed: usize,
}

impl RequestCounts {
    pub fn total(&self) -> usize {
        self.idle + self.submitted + self.completed
    }

    pub(crate) fn tally<'a>(requests: impl Iterator<Item = &'a CaptureRequest>) -> Self {
        requests.fold(Self::default(), |mut counts, request| {
            match request.state {
                RequestState::Idle => counts.idle += 1,
                RequestState::Submitted => counts.submitted += 1,
                RequestState::Completed => counts.completed += 1,
            }
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::controls::{ControlId, ControlValue};

    fn request() -> CaptureRequest {
        CaptureRequest::new(0, BTreeMap::from([(StreamId(0), BufferId(4))]))
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut req = request();
        assert_eq!(req.state(), RequestState::Idle);

        let mut controls = ControlList::new();
        controls.set(ControlId::Brightness, ControlValue::Float(0.5));
        let submission = req.submit(controls);
        assert_eq!(submission.cookie, 0);
        assert_eq!(submission.controls.len(), 1);
        assert_eq!(req.state(), RequestState::Submitted);

        req.complete(9);
        assert!(req.backs(9));
        assert!(!req.backs(8));

        req.reuse(BTreeMap::from([(StreamId(0), BufferId(4))]));
        assert_eq!(req.state(), RequestState::Idle);
        assert!(!req.backs(9));
    }

    #[test]
    fn test_counts_total() {
        let mut a = request();
        let mut b = request();
        let c = request();
        a.submit(ControlList::new());
        b.complete(1);

        let counts = RequestCounts::tally([a, b, c].iter());
        assert_eq!(counts, RequestCounts { idle: 1, submitted: 1, completed: 1 });
        assert_eq!(counts.total(), 3);
    }
}
