//! Queue of in-flight answers with an event-based wait.
//!
//! Waiters collect every answer that became dirty since the last call;
//! spurious wake-ups simply loop back into the dirty scan.  Disposing the
//! queue force-fails all pending work and is terminal: no new answers can
//! be created afterwards.

use crate::answer::{Answer, AnswerContext, AnswerError};
use crate::sync::Event;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Timeout semantics of [`AnswerQueue::wait`].
#[derive(Debug, Clone, Copy)]
pub enum WaitTimeout {
    /// Poll: never blocks.
    NonBlocking,
    /// Blocks up to the duration.
    Bounded(Duration),
    /// Blocks until something becomes dirty.
    Unbounded,
}

#[derive(Default)]
struct QueueInner {
    answers: Vec<Arc<Answer>>,
    disposed: bool,
}

#[derive(Default)]
pub struct AnswerQueue {
    event: Arc<Event>,
    inner: Mutex<QueueInner>,
}

impl AnswerQueue {
    pub fn new() -> AnswerQueue {
        AnswerQueue::default()
    }

    pub fn new_answer(&self) -> Result<Arc<Answer>, AnswerError> {
        self.new_answer_with(AnswerContext::None)
    }

    pub fn new_answer_with(&self, context: AnswerContext) -> Result<Arc<Answer>, AnswerError> {
        let mut inner = self.lock();
        if inner.disposed {
            return Err(AnswerError::Disposed);
        }
        let answer = Arc::new(Answer::new(Arc::clone(&self.event), context));
        inner.answers.push(Arc::clone(&answer));
        Ok(answer)
    }

    /// Fill `out` with all answers that became dirty, clearing their dirty
    /// flags; true when any were found before the timeout.
    pub fn wait(&self, timeout: WaitTimeout, out: &mut Vec<Arc<Answer>>) -> bool {
        loop {
            let dirty = self.list_dirty();
            if !dirty.is_empty() {
                *out = dirty;
                return true;
            }
            if self.is_disposed() {
                return false;
            }

            match timeout {
                WaitTimeout::NonBlocking => return false,
                WaitTimeout::Unbounded => self.event.wait(),
                WaitTimeout::Bounded(duration) => {
                    if !self.event.try_wait(duration) {
                        return false;
                    }
                }
            }
        }
    }

    /// Answers that are settled (not pending) right now.
    pub fn finished_answers(&self) -> Vec<Arc<Answer>> {
        self.lock()
            .answers
            .iter()
            .filter(|a| !a.is_pending())
            .cloned()
            .collect()
    }

    pub fn remove(&self, answer: &Arc<Answer>) {
        self.lock().answers.retain(|a| !Arc::ptr_eq(a, answer));
    }

    pub fn size(&self) -> usize {
        self.lock().answers.len()
    }

    /// Force-fail everything still owned and refuse new answers from now
    /// on.  Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }

        for answer in &inner.answers {
            let missing = answer
                .handlers_count()
                .saturating_sub(answer.results_count());
            if missing > 0 {
                debug!(missing, "finalizing answer with missing results");
            }
            answer.finalize_failed();
        }

        inner.answers.clear();
        inner.disposed = true;
        self.event.set();
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn list_dirty(&self) -> Vec<Arc<Answer>> {
        self.lock()
            .answers
            .iter()
            .filter(|a| a.take_dirty())
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::{CommandResult, ResultStatus};
    use std::thread;

    #[test]
    fn nonblocking_wait_never_blocks() {
        let queue = AnswerQueue::new();
        let mut out = Vec::new();
        assert!(!queue.wait(WaitTimeout::NonBlocking, &mut out));
    }

    #[test]
    fn wait_returns_dirty_answers_and_clears_flags() {
        let queue = AnswerQueue::new();
        let answer = queue.new_answer().unwrap();
        answer.set_handlers_count(1);
        let result = CommandResult::new(&answer);
        result.set_status(ResultStatus::Success).unwrap();

        let mut out = Vec::new();
        assert!(queue.wait(WaitTimeout::NonBlocking, &mut out));
        assert_eq!(out.len(), 1);
        assert!(Arc::ptr_eq(&out[0], &answer));

        // the dirty flag was consumed
        out.clear();
        assert!(!queue.wait(WaitTimeout::NonBlocking, &mut out));
    }

    #[test]
    fn bounded_wait_times_out_without_activity() {
        let queue = AnswerQueue::new();
        let mut out = Vec::new();
        let started = std::time::Instant::now();
        assert!(!queue.wait(WaitTimeout::Bounded(Duration::from_millis(30)), &mut out));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn unbounded_wait_wakes_on_a_status_change() {
        let queue = Arc::new(AnswerQueue::new());
        let answer = queue.new_answer().unwrap();
        answer.set_handlers_count(1);
        let result = CommandResult::new(&answer);

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut out = Vec::new();
                queue.wait(WaitTimeout::Unbounded, &mut out);
                out.len()
            })
        };

        thread::sleep(Duration::from_millis(20));
        result.set_status(ResultStatus::Failed).unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn dispose_fails_everything_and_is_terminal() {
        let queue = AnswerQueue::new();
        let answer = queue.new_answer().unwrap();
        answer.set_handlers_count(2);
        let reported = CommandResult::new(&answer);
        reported.set_status(ResultStatus::Success).unwrap();

        queue.dispose();

        assert!(!answer.is_pending());
        assert_eq!(answer.results_count(), 2);
        assert!(
            answer
                .statuses()
                .iter()
                .all(|s| *s != ResultStatus::Pending)
        );

        assert!(matches!(queue.new_answer(), Err(AnswerError::Disposed)));

        // idempotent
        queue.dispose();
        assert!(queue.is_disposed());
    }

    #[test]
    fn remove_forgets_an_answer() {
        let queue = AnswerQueue::new();
        let answer = queue.new_answer().unwrap();
        assert_eq!(queue.size(), 1);
        queue.remove(&answer);
        assert_eq!(queue.size(), 0);
    }
}
