//! Aggregate outcome of one command's execution across multiple handlers.
//!
//! An [`Answer`] owns the synchronized state: one result slot per handler,
//! the expected handler count and a dirty flag.  Results are thin façades
//! over their slot — all their accesses go through the owning Answer's
//! mutex, and every status change signals the queue event so
//! `AnswerQueue::wait` wakes up.
//!
//! Status transitions are monotonic: PENDING may move to SUCCESS or FAILED
//! exactly once; anything else is an invalid argument.

use crate::sync::Event;
use gw_protocol::{DeviceID, DevicePrefix, GWMessage};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Status and payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Pending,
    Success,
    Failed,
}

impl Default for ResultStatus {
    fn default() -> Self {
        ResultStatus::Pending
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Pending => "PENDING",
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Typed payload a handler may attach to its result.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResultData {
    #[default]
    None,
    /// Devices the server reports as paired.
    DeviceList(Vec<DeviceID>),
    /// Most recent value of a module; `None` when the server has no valid
    /// value.
    LastValue(Option<f64>),
}

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("invalid status change: {0} -> {1}")]
    InvalidTransition(ResultStatus, ResultStatus),
    #[error("answer queue is disposed")]
    Disposed,
}

// ---------------------------------------------------------------------------
// Answer
// ---------------------------------------------------------------------------

/// What the answer refers to; lets loops waiting on a queue route a finished
/// answer back to its origin.
#[derive(Debug, Clone, Default)]
pub enum AnswerContext {
    #[default]
    None,
    /// Issued for a device-prefix reconciliation.
    Prefix(DevicePrefix),
    /// Created from a server request; holds the request for the response.
    ServerRequest(Arc<GWMessage>),
}

#[derive(Debug, Default)]
struct ResultSlot {
    status: ResultStatus,
    data: ResultData,
}

#[derive(Debug, Default)]
struct AnswerState {
    slots: Vec<ResultSlot>,
    handlers_count: usize,
    dirty: bool,
}

#[derive(Debug)]
pub struct Answer {
    context: AnswerContext,
    event: Arc<Event>,
    state: Mutex<AnswerState>,
}

impl Answer {
    pub(crate) fn new(event: Arc<Event>, context: AnswerContext) -> Answer {
        Answer {
            context,
            event,
            state: Mutex::new(AnswerState::default()),
        }
    }

    pub fn context(&self) -> &AnswerContext {
        &self.context
    }

    pub fn prefix(&self) -> Option<DevicePrefix> {
        match &self.context {
            AnswerContext::Prefix(prefix) => Some(*prefix),
            _ => None,
        }
    }

    pub fn server_request(&self) -> Option<&Arc<GWMessage>> {
        match &self.context {
            AnswerContext::ServerRequest(request) => Some(request),
            _ => None,
        }
    }

    fn push_slot(&self) -> usize {
        let mut state = self.lock();
        state.slots.push(ResultSlot::default());
        state.slots.len() - 1
    }

    /// Number of handlers expected to report.  When the answer turns out to
    /// be settled already (e.g. no handler accepted the command), the queue
    /// is notified right away.
    pub fn set_handlers_count(&self, count: usize) {
        let mut state = self.lock();
        state.handlers_count = count;
        if !is_pending(&state) {
            notify(&mut state, &self.event);
        }
    }

    pub fn handlers_count(&self) -> usize {
        self.lock().handlers_count
    }

    pub fn results_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Pending until every expected handler has reported a final status.
    pub fn is_pending(&self) -> bool {
        is_pending(&self.lock())
    }

    pub fn statuses(&self) -> Vec<ResultStatus> {
        self.lock().slots.iter().map(|s| s.status).collect()
    }

    pub fn result_data(&self, index: usize) -> Option<ResultData> {
        self.lock().slots.get(index).map(|s| s.data.clone())
    }

    /// Block until the answer settles.  `None` waits unboundedly; returns
    /// whether the answer is settled.
    pub fn wait_not_pending(&self, timeout: Option<std::time::Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if !self.is_pending() {
                return true;
            }
            match deadline {
                None => self.event.wait(),
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline || !self.event.try_wait(deadline - now) {
                        return !self.is_pending();
                    }
                }
            }
        }
    }

    pub(crate) fn take_dirty(&self) -> bool {
        let mut state = self.lock();
        let was = state.dirty;
        state.dirty = false;
        was
    }

    /// Synthesize results for handlers that never reported and force every
    /// pending result to FAILED.  Used on queue disposal.
    pub(crate) fn finalize_failed(&self) {
        let mut state = self.lock();
        while state.slots.len() < state.handlers_count {
            state.slots.push(ResultSlot::default());
        }
        for slot in &mut state.slots {
            if slot.status == ResultStatus::Pending {
                slot.status = ResultStatus::Failed;
            }
        }
        notify(&mut state, &self.event);
    }

    fn lock(&self) -> MutexGuard<'_, AnswerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_pending(state: &AnswerState) -> bool {
    if state.handlers_count != state.slots.len() {
        return true;
    }
    if state.handlers_count == 0 {
        return false;
    }
    state
        .slots
        .iter()
        .any(|s| s.status == ResultStatus::Pending)
}

fn notify(state: &mut AnswerState, event: &Event) {
    state.dirty = true;
    event.set();
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

/// Façade over one result slot; shares the owning Answer's lock.
#[derive(Clone)]
pub struct CommandResult {
    answer: Arc<Answer>,
    index: usize,
}

impl CommandResult {
    /// Bind a fresh pending result to `answer`.  Every handler creates
    /// exactly one.
    pub fn new(answer: &Arc<Answer>) -> CommandResult {
        CommandResult {
            answer: Arc::clone(answer),
            index: answer.push_slot(),
        }
    }

    pub fn status(&self) -> ResultStatus {
        self.answer.lock().slots[self.index].status
    }

    /// Transition out of PENDING.  Setting the same status again is a
    /// no-op; any other change of a settled status is rejected.
    pub fn set_status(&self, status: ResultStatus) -> Result<(), AnswerError> {
        let mut state = self.answer.lock();
        let current = state.slots[self.index].status;

        if current == status {
            return Ok(());
        }
        if current != ResultStatus::Pending || status == ResultStatus::Pending {
            return Err(AnswerError::InvalidTransition(current, status));
        }

        state.slots[self.index].status = status;
        notify(&mut state, &self.answer.event);
        Ok(())
    }

    pub fn set_device_list(&self, devices: Vec<DeviceID>) {
        self.answer.lock().slots[self.index].data = ResultData::DeviceList(devices);
    }

    pub fn set_last_value(&self, value: Option<f64>) {
        self.answer.lock().slots[self.index].data = ResultData::LastValue(value);
    }

    pub fn answer(&self) -> &Arc<Answer> {
        &self.answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone_answer() -> Arc<Answer> {
        Arc::new(Answer::new(Arc::new(Event::new()), AnswerContext::None))
    }

    #[test]
    fn settles_once_every_handler_reports() {
        let answer = standalone_answer();
        answer.set_handlers_count(2);
        assert!(answer.is_pending());

        let first = CommandResult::new(&answer);
        let second = CommandResult::new(&answer);
        assert!(answer.is_pending());

        first.set_status(ResultStatus::Success).unwrap();
        assert!(answer.is_pending());

        second.set_status(ResultStatus::Failed).unwrap();
        assert!(!answer.is_pending());
    }

    #[test]
    fn zero_handlers_means_settled() {
        let answer = standalone_answer();
        answer.set_handlers_count(0);
        assert!(!answer.is_pending());
        assert!(answer.take_dirty());
    }

    #[test]
    fn status_cannot_regress() {
        let answer = standalone_answer();
        answer.set_handlers_count(1);
        let result = CommandResult::new(&answer);

        result.set_status(ResultStatus::Failed).unwrap();
        assert!(matches!(
            result.set_status(ResultStatus::Success),
            Err(AnswerError::InvalidTransition(_, _))
        ));
        assert!(matches!(
            result.set_status(ResultStatus::Pending),
            Err(AnswerError::InvalidTransition(_, _))
        ));
        // same status again is a no-op
        result.set_status(ResultStatus::Failed).unwrap();
    }

    #[test]
    fn status_change_marks_the_answer_dirty() {
        let answer = standalone_answer();
        answer.set_handlers_count(1);
        let result = CommandResult::new(&answer);
        assert!(!answer.take_dirty());

        result.set_status(ResultStatus::Success).unwrap();
        assert!(answer.take_dirty());
        assert!(!answer.take_dirty());
    }

    #[test]
    fn finalize_synthesizes_missing_results_as_failed() {
        let answer = standalone_answer();
        answer.set_handlers_count(3);
        let reported = CommandResult::new(&answer);
        reported.set_status(ResultStatus::Success).unwrap();

        answer.finalize_failed();
        assert!(!answer.is_pending());
        assert_eq!(answer.results_count(), 3);
        assert_eq!(
            answer.statuses(),
            vec![
                ResultStatus::Success,
                ResultStatus::Failed,
                ResultStatus::Failed
            ]
        );
    }

    #[test]
    fn result_payload_round_trips() {
        let answer = standalone_answer();
        answer.set_handlers_count(1);
        let result = CommandResult::new(&answer);
        result.set_device_list(vec![DeviceID::from_raw(1), DeviceID::from_raw(2)]);

        assert_eq!(
            answer.result_data(0),
            Some(ResultData::DeviceList(vec![
                DeviceID::from_raw(1),
                DeviceID::from_raw(2)
            ]))
        );
    }
}
