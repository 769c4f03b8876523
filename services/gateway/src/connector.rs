//! Server-link contract: priority-ordered sending and listener fan-out.
//!
//! A connector accepts outbound messages into priority queues and fires
//! events about the link and about received messages.  Listeners are
//! delivered on the events executor and must be non-blocking; delivery
//! order follows submission order (the executor is serial).

use gateway_core::dispatch::AsyncExecutor;
use gw_protocol::{GWMessage, MessageKind};
use std::sync::{Arc, Mutex};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Events related to the communication with the remote server.  All methods
/// default to no-ops so listeners implement only what they care about.
#[allow(unused_variables)]
pub trait GwsListener: Send + Sync {
    /// The link is established; messages can be exchanged.
    fn on_connected(&self, address: &str) {}

    /// The link broke or was closed on request.
    fn on_disconnected(&self, address: &str) {}

    /// A message is about to be written to the network.
    fn on_try_send(&self, message: &GWMessage) {}

    /// A message was successfully written to the network.
    fn on_sent(&self, message: &GWMessage) {}

    fn on_request(&self, request: &GWMessage) {}
    fn on_response(&self, response: &GWMessage) {}
    fn on_ack(&self, ack: &GWMessage) {}

    /// A received message outside the request/response/ack tree.
    fn on_other(&self, message: &GWMessage) {}
}

/// Fan-out of [`GwsListener`] events through an executor.
pub struct GwsEventSource {
    listeners: Mutex<Vec<Arc<dyn GwsListener>>>,
    executor: Arc<dyn AsyncExecutor>,
}

impl GwsEventSource {
    pub fn new(executor: Arc<dyn AsyncExecutor>) -> GwsEventSource {
        GwsEventSource {
            listeners: Mutex::new(Vec::new()),
            executor,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn GwsListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn each(&self, job: impl Fn(&dyn GwsListener) + Send + Sync + 'static) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let job = Arc::new(job);
        for listener in listeners {
            let job = Arc::clone(&job);
            self.executor
                .invoke(Box::new(move || job(listener.as_ref())));
        }
    }

    pub fn fire_connected(&self, address: &str) {
        let address = address.to_string();
        self.each(move |l| l.on_connected(&address));
    }

    pub fn fire_disconnected(&self, address: &str) {
        let address = address.to_string();
        self.each(move |l| l.on_disconnected(&address));
    }

    pub fn fire_try_send(&self, message: &Arc<GWMessage>) {
        let message = Arc::clone(message);
        self.each(move |l| l.on_try_send(&message));
    }

    pub fn fire_sent(&self, message: &Arc<GWMessage>) {
        let message = Arc::clone(message);
        self.each(move |l| l.on_sent(&message));
    }

    /// Route a received message to the matching listener event.
    pub fn fire_received(&self, message: &Arc<GWMessage>) {
        let message = Arc::clone(message);
        self.each(move |l| match message.kind() {
            MessageKind::Request => l.on_request(&message),
            MessageKind::Response => l.on_response(&message),
            MessageKind::Ack => l.on_ack(&message),
            MessageKind::Other => l.on_other(&message),
        });
    }
}

// ---------------------------------------------------------------------------
// Connector contract
// ---------------------------------------------------------------------------

/// Message transport to the remote server.  `send` only enqueues; delivery
/// order across queues follows the priority selection of
/// [`PriorityOutputs`].
pub trait GwsConnector: Send + Sync {
    fn send(&self, message: GWMessage) -> Result<(), ConnectorError>;
    fn add_listener(&self, listener: Arc<dyn GwsListener>);
}

// ---------------------------------------------------------------------------
// Priority assignment
// ---------------------------------------------------------------------------

/// Maps each outgoing message to an output queue index (lower = more
/// urgent).
pub trait GwsPriorityAssigner: Send + Sync {
    fn assign(&self, message: &GWMessage) -> usize;
}

/// The production assignment: responses and acks first, requests next,
/// bulk sensor-data exports last, everything else in between.
pub struct FixedPriorityAssigner;

const RESPONSE_PRIORITY: usize = 0;
const REQUEST_PRIORITY: usize = 1;
const OTHERS_PRIORITY: usize = 2;
const DATA_PRIORITY: usize = 3;

impl GwsPriorityAssigner for FixedPriorityAssigner {
    fn assign(&self, message: &GWMessage) -> usize {
        match message {
            GWMessage::GenericResponse(_)
            | GWMessage::GenericAck(_)
            | GWMessage::ResponseWithAck(_)
            | GWMessage::UnpairResponse(_) => RESPONSE_PRIORITY,
            GWMessage::SensorDataExport(_) => DATA_PRIORITY,
            m if m.kind() == MessageKind::Request => REQUEST_PRIORITY,
            _ => OTHERS_PRIORITY,
        }
    }
}

// ---------------------------------------------------------------------------
// PriorityOutputs
// ---------------------------------------------------------------------------

struct OutputsInner {
    queues: Vec<VecDeque<GWMessage>>,
    status: Vec<usize>,
}

/// The connector's output queues with the fairness bookkeeping.
///
/// Selection picks the highest-priority *eligible* non-empty queue, where a
/// queue is eligible when its send count does not exceed the combined send
/// counts of the non-empty queues below it — so urgent queues are serviced
/// more often while starved queues always catch up.  The last queue is
/// always eligible as a fallback.  Send counts are divided by 16 whenever
/// one reaches 16, which preserves their ratios while bounding growth.
pub struct PriorityOutputs {
    inner: Mutex<OutputsInner>,
}

impl PriorityOutputs {
    /// `count` queues, index 0 the most urgent.  At least one is required.
    pub fn new(count: usize) -> PriorityOutputs {
        let count = count.max(1);
        PriorityOutputs {
            inner: Mutex::new(OutputsInner {
                queues: (0..count).map(|_| VecDeque::new()).collect(),
                status: vec![0; count],
            }),
        }
    }

    pub fn push(&self, priority: usize, message: GWMessage) {
        let mut inner = self.lock();
        let index = priority.min(inner.queues.len() - 1);
        inner.queues[index].push_back(message);
    }

    /// The queue to service next, if any is non-empty.
    pub fn select(&self) -> Option<usize> {
        let inner = self.lock();
        let n = inner.queues.len();

        let mut eligible = vec![false; n];
        for i in 0..n {
            let mut others = 0;
            let mut count = 0;
            for j in i + 1..n {
                if inner.queues[j].is_empty() {
                    continue;
                }
                others += inner.status[j];
                count += 1;
            }
            if inner.status[i] <= others || count == 0 {
                eligible[i] = true;
            }
        }
        eligible[n - 1] = true;

        (0..n).find(|&i| eligible[i] && !inner.queues[i].is_empty())
    }

    pub fn front(&self, index: usize) -> Option<GWMessage> {
        self.lock().queues.get(index)?.front().cloned()
    }

    pub fn pop(&self, index: usize) -> Option<GWMessage> {
        self.lock().queues.get_mut(index)?.pop_front()
    }

    /// Account a send from queue `index`, decaying all counters once one
    /// reaches 16.
    pub fn mark_used(&self, index: usize) {
        let mut inner = self.lock();
        inner.status[index] += 1;

        let highest = inner.status.iter().copied().max().unwrap_or(0);
        if highest >= 16 {
            for status in &mut inner.status {
                *status /= 16;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queues.iter().all(VecDeque::is_empty)
    }

    /// `(queued, sends)` per queue, for logging.
    pub fn stats(&self) -> Vec<(usize, usize)> {
        let inner = self.lock();
        inner
            .queues
            .iter()
            .zip(&inner.status)
            .map(|(q, s)| (q.len(), *s))
            .collect()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let summary: Vec<String> = stats
            .iter()
            .map(|(len, status)| format!("{len} [{status}]"))
            .collect();
        info!(queues = %summary.join(", "), "output queues");
    }

    #[cfg(test)]
    fn set_status(&self, status: Vec<usize>) {
        self.lock().status = status;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
