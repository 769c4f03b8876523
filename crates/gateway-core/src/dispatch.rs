//! Command dispatch: route a command to every accepting handler and bind
//! their results into one answer.
//!
//! Handlers run as jobs on an executor, so a slow handler never blocks the
//! dispatching thread.  The handler contract: `handle` must create exactly
//! one result bound to the answer and move it out of PENDING before
//! returning — results a crashed or sloppy handler leaves pending are
//! eventually failed by `AnswerQueue::dispose`.

use crate::answer::{Answer, AnswerContext, AnswerError};
use crate::answer_queue::AnswerQueue;
use crate::command::{Command, CommandError, CommandKind};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Job-submission seam used for handler execution and listener delivery.
pub trait AsyncExecutor: Send + Sync {
    fn invoke(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs jobs on tokio's blocking thread pool.
pub struct BlockingPoolExecutor {
    handle: tokio::runtime::Handle,
}

impl BlockingPoolExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> BlockingPoolExecutor {
        BlockingPoolExecutor { handle }
    }

    /// Executor bound to the current runtime.
    pub fn current() -> BlockingPoolExecutor {
        BlockingPoolExecutor::new(tokio::runtime::Handle::current())
    }
}

impl AsyncExecutor for BlockingPoolExecutor {
    fn invoke(&self, job: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(job);
    }
}

/// Runs jobs inline on the calling thread.  For tests and simple setups.
pub struct SameThreadExecutor;

impl AsyncExecutor for SameThreadExecutor {
    fn invoke(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Runs jobs one after another on a dedicated thread, preserving submission
/// order.  Listener fan-out uses this so event order is stable.
pub struct SerialExecutor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SerialExecutor {
    pub fn new(name: &str) -> SerialExecutor {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .ok();

        SerialExecutor {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }
}

impl AsyncExecutor for SerialExecutor {
    fn invoke(&self, job: Box<dyn FnOnce() + Send>) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(job);
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = worker.join();
        }
    }
}

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

/// A component able to execute commands.  `handle` is called concurrently
/// and must be thread-safe.
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this handler executes the given command.
    fn accept(&self, cmd: &Command) -> bool;

    /// Execute the command.  Must create exactly one result bound to
    /// `answer` and settle it before returning.
    fn handle(&self, cmd: &Command, answer: &Arc<Answer>) -> Result<(), CommandError>;
}

/// Observer of dispatched commands.
pub trait DispatchListener: Send + Sync {
    fn on_dispatch(&self, cmd: &Command);
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler {0} is already registered")]
    Exists(String),
}

// ---------------------------------------------------------------------------
// CommandDispatcher
// ---------------------------------------------------------------------------

pub struct CommandDispatcher {
    handlers: Mutex<Vec<Arc<dyn CommandHandler>>>,
    listeners: Mutex<Vec<Arc<dyn DispatchListener>>>,
    executor: Arc<dyn AsyncExecutor>,
}

impl CommandDispatcher {
    pub fn new(executor: Arc<dyn AsyncExecutor>) -> CommandDispatcher {
        CommandDispatcher {
            handlers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            executor,
        }
    }

    /// Register a handler; duplicates are rejected.
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return Err(DispatchError::Exists(handler.name().to_string()));
        }
        handlers.push(handler);
        Ok(())
    }

    pub fn register_listener(&self, listener: Arc<dyn DispatchListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Route `cmd` to every accepting handler, skipping the command's own
    /// sending handler, and bind their results into `answer`.
    pub fn dispatch(&self, cmd: Arc<Command>, answer: Arc<Answer>) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            let cmd = Arc::clone(&cmd);
            self.executor
                .invoke(Box::new(move || listener.on_dispatch(&cmd)));
        }

        debug!(command = %cmd, "dispatching");

        let sending = cmd.sending_handler();
        let accepting: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| {
                if let Some(sender) = &sending {
                    if Arc::ptr_eq(h, sender) {
                        return false;
                    }
                }
                h.accept(&cmd)
            })
            .cloned()
            .collect();

        // settles (and notifies) right away when nobody accepts
        answer.set_handlers_count(accepting.len());
        if accepting.is_empty() {
            return;
        }

        for handler in accepting {
            let cmd = Arc::clone(&cmd);
            let answer = Arc::clone(&answer);
            self.executor.invoke(Box::new(move || {
                if let Err(e) = handler.handle(&cmd, &answer) {
                    warn!(
                        handler = handler.name(),
                        command = %cmd,
                        error = %e,
                        "command handler failed"
                    );
                }
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// CommandSender
// ---------------------------------------------------------------------------

/// Dispatch access for components that send commands: owns an implicit
/// answer queue and tags outgoing commands with the component's own handler
/// identity so the dispatcher can avoid self-feedback.
pub struct CommandSender {
    dispatcher: Arc<CommandDispatcher>,
    queue: AnswerQueue,
    self_handler: Mutex<Option<Weak<dyn CommandHandler>>>,
}

impl CommandSender {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> CommandSender {
        CommandSender {
            dispatcher,
            queue: AnswerQueue::new(),
            self_handler: Mutex::new(None),
        }
    }

    /// Declare that the owning component is also a command handler.
    pub fn set_as_handler(&self, handler: &Arc<dyn CommandHandler>) {
        *self.self_handler.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::downgrade(handler));
    }

    pub fn answer_queue(&self) -> &AnswerQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Dispatch with an explicit answer.
    pub fn dispatch(&self, kind: CommandKind, answer: Arc<Answer>) {
        let mut cmd = Command::new(kind);
        if let Some(handler) = self
            .self_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            cmd.set_sending_handler(handler);
        }
        self.dispatcher.dispatch(Arc::new(cmd), answer);
    }

    /// Dispatch on a fresh answer from the implicit queue.
    pub fn dispatch_new(
        &self,
        kind: CommandKind,
        context: AnswerContext,
    ) -> Result<Arc<Answer>, AnswerError> {
        let answer = self.queue.new_answer_with(context)?;
        self.dispatch(kind, Arc::clone(&answer));
        Ok(answer)
    }

    /// Dispatch and block until the answer settles.
    pub fn dispatch_sync(&self, kind: CommandKind) -> Result<Arc<Answer>, AnswerError> {
        let answer = self.dispatch_new(kind, AnswerContext::None)?;
        answer.wait_not_pending(None);
        Ok(answer)
    }
}
