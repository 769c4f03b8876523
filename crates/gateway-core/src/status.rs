//! Periodic reconciliation of the server's view of paired devices.
//!
//! For every registered device-prefix handler the fetcher dispatches a
//! `ServerDeviceList` command, waits for its prefix-tagged answer and hands
//! the union of returned IDs to the handlers of that prefix.  A failed
//! request is repeated after `repeat_timeout`; a successful one is never
//! repeated.

use crate::answer::{Answer, AnswerContext, ResultData, ResultStatus};
use crate::answer_queue::WaitTimeout;
use crate::command::{CommandError, CommandKind};
use crate::dispatch::{CommandDispatcher, CommandSender};
use crate::sync::StopControl;
use gw_protocol::{DeviceID, DevicePrefix};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Receives the paired-device set the server reports for a prefix.
pub trait DeviceStatusHandler: Send + Sync {
    fn prefix(&self) -> DevicePrefix;
    fn handle_remote_status(&self, prefix: DevicePrefix, paired: &BTreeSet<DeviceID>);
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Sleep when there is nothing to do at all.
    pub idle_duration: Duration,
    /// Granularity of polling the answer queue while requests are active.
    pub wait_timeout: Duration,
    /// Delay before repeating an unsuccessful request.
    pub repeat_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> FetcherConfig {
        FetcherConfig {
            idle_duration: Duration::from_secs(30 * 60),
            wait_timeout: Duration::from_secs(1),
            repeat_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl FetcherConfig {
    fn validate(&self) -> Result<(), CommandError> {
        if self.idle_duration < Duration::from_secs(1) {
            return Err(CommandError::InvalidArgument(
                "idle duration must be at least 1 s".into(),
            ));
        }
        if self.wait_timeout < Duration::from_millis(1) {
            return Err(CommandError::InvalidArgument(
                "wait timeout must be at least 1 ms".into(),
            ));
        }
        if self.repeat_timeout < Duration::from_millis(1) {
            return Err(CommandError::InvalidArgument(
                "repeat timeout must be at least 1 ms".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-prefix state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PrefixStatus {
    last_requested: Option<Instant>,
    started: bool,
    successful: bool,
}

impl PrefixStatus {
    fn start_request(&mut self) {
        self.last_requested = Some(Instant::now());
        self.started = true;
    }

    fn should_repeat(&self, repeat_timeout: Duration) -> bool {
        if !self.started || self.successful {
            return false;
        }
        self.last_requested
            .is_none_or(|at| at.elapsed() > repeat_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    /// Everything reconciled; sleep long.
    Nothing,
    /// Some request failed and waits for its repeat window.
    WouldRepeat,
    /// Requests are in flight; keep polling the answer queue.
    Active,
}

// ---------------------------------------------------------------------------
// DeviceStatusFetcher
// ---------------------------------------------------------------------------

pub struct DeviceStatusFetcher {
    config: FetcherConfig,
    sender: CommandSender,
    handlers: Mutex<HashMap<DevicePrefix, Vec<Arc<dyn DeviceStatusHandler>>>>,
    status: Mutex<HashMap<DevicePrefix, PrefixStatus>>,
    stop: StopControl,
}

impl DeviceStatusFetcher {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        config: FetcherConfig,
    ) -> Result<DeviceStatusFetcher, CommandError> {
        config.validate()?;
        Ok(DeviceStatusFetcher {
            config,
            sender: CommandSender::new(dispatcher),
            handlers: Mutex::new(HashMap::new()),
            status: Mutex::new(HashMap::new()),
            stop: StopControl::new(),
        })
    }

    pub fn register_handler(&self, handler: Arc<dyn DeviceStatusHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(handler.prefix())
            .or_default()
            .push(handler);
    }

    pub fn run(&self) {
        info!("starting device status fetcher");

        while !self.stop.should_stop() {
            match self.fetch_undone() {
                FetchState::Nothing => {
                    if self.sender.answer_queue().size() == 0 {
                        debug!("nothing to do, sleeping");
                        self.stop.wait_stoppable(self.config.idle_duration);
                        continue;
                    }
                }
                FetchState::WouldRepeat => {
                    if self.sender.answer_queue().size() == 0 {
                        debug!("would repeat some, sleeping now");
                        self.stop.wait_stoppable(self.config.repeat_timeout);
                        continue;
                    }
                }
                FetchState::Active => {}
            }

            let mut dirty = Vec::new();
            self.sender
                .answer_queue()
                .wait(WaitTimeout::Bounded(self.config.wait_timeout), &mut dirty);

            for answer in dirty {
                self.process_dirty(&answer);
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name("status-fetcher".into())
            .spawn(move || this.run())
            .expect("cannot spawn status fetcher thread")
    }

    pub fn stop(&self) {
        self.stop.request_stop();
        self.sender.answer_queue().dispose();
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn fetch_undone(&self) -> FetchState {
        let prefixes: Vec<DevicePrefix> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.keys().copied().collect()
        };

        let mut to_request = Vec::new();
        let mut would_repeat = false;
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            for prefix in prefixes {
                let entry = status.entry(prefix).or_default();
                if !entry.started || entry.should_repeat(self.config.repeat_timeout) {
                    entry.start_request();
                    to_request.push(prefix);
                } else if entry.started && !entry.successful {
                    would_repeat = true;
                }
            }
        }

        let started = !to_request.is_empty();
        for prefix in to_request {
            debug!(prefix = %prefix, "fetching paired devices");
            if let Err(e) = self.sender.dispatch_new(
                CommandKind::ServerDeviceList { prefix },
                AnswerContext::Prefix(prefix),
            ) {
                warn!(prefix = %prefix, error = %e, "cannot dispatch device list command");
            }
        }

        if started {
            FetchState::Active
        } else if would_repeat {
            FetchState::WouldRepeat
        } else {
            FetchState::Nothing
        }
    }

    // -----------------------------------------------------------------------
    // Answer processing
    // -----------------------------------------------------------------------

    fn process_dirty(&self, answer: &Arc<Answer>) {
        if answer.is_pending() {
            debug!("answer is pending");
            return;
        }

        self.sender.answer_queue().remove(answer);

        if answer.handlers_count() == 0 {
            warn!("answer has no handlers");
            return;
        }

        let Some(prefix) = answer.prefix() else {
            warn!("answer carries no device prefix");
            return;
        };

        let handlers: Vec<_> = {
            let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&prefix).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            warn!(prefix = %prefix, "no handlers for prefix");
            return;
        }

        let mut paired = BTreeSet::new();
        let mut success = false;
        let mut failed = false;

        for (i, status) in answer.statuses().iter().enumerate() {
            if *status != ResultStatus::Success {
                warn!(
                    result = i + 1,
                    total = answer.results_count(),
                    "device list result has failed"
                );
                failed = true;
                continue;
            }
            success = true;

            match answer.result_data(i) {
                Some(ResultData::DeviceList(devices)) => {
                    self.collect_paired(&mut paired, &devices, prefix);
                }
                _ => warn!("successful result carries no device list"),
            }
        }

        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = status.get_mut(&prefix) {
                entry.successful = !failed;
            }
        }

        if success && failed {
            debug!("answer was partially successful, the request will repeat");
        }
        if !success {
            return;
        }

        for handler in handlers {
            handler.handle_remote_status(prefix, &paired);
        }
    }

    fn collect_paired(
        &self,
        paired: &mut BTreeSet<DeviceID>,
        received: &[DeviceID],
        prefix: DevicePrefix,
    ) {
        for id in received {
            if id.prefix() != prefix {
                warn!(id = %id, prefix = %prefix, "ID does not match the requested prefix");
                continue;
            }
            trace!(id = %id, "received paired ID");
            paired.insert(*id);
        }
    }
}
