//! Fan-out of measured data to registered exporters.
//!
//! Every exporter is guarded by a bounded queue: enqueueing over capacity
//! drops the oldest item, a full exporter backs the queue off, and a
//! repeatedly broken exporter is benched until its dead timeout elapses.
//! One worker thread services all queues.

use crate::sync::{Event, StopControl};
use gw_protocol::SensorData;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("exporter is broken: {0}")]
    Broken(String),
    #[error("connection lost: {0}")]
    Connection(String),
}

/// Destination for measured data.
///
/// `ship` returns true when the item was taken over, false when the
/// exporter is saturated and the caller should back off; an error means the
/// exporter is broken.
pub trait Exporter: Send + Sync {
    fn ship(&self, data: &SensorData) -> Result<bool, ExportError>;
}

// ---------------------------------------------------------------------------
// ExporterQueue
// ---------------------------------------------------------------------------

struct Health {
    fails: u32,
    working: bool,
    failure_at: Instant,
}

pub struct ExporterQueue {
    exporter: Arc<dyn Exporter>,
    /// Max items shipped per `export_batch`; 0 = unlimited.
    batch_size: usize,
    /// Max queued items; 0 = unlimited.
    capacity: usize,
    /// Consecutive broken shipments before the queue is benched; 0 = never.
    threshold: u32,
    queue: Mutex<VecDeque<SensorData>>,
    health: Mutex<Health>,
    dropped: AtomicU64,
    sent: AtomicU64,
}

impl ExporterQueue {
    pub fn new(
        exporter: Arc<dyn Exporter>,
        batch_size: usize,
        capacity: usize,
        threshold: u32,
    ) -> ExporterQueue {
        ExporterQueue {
            exporter,
            batch_size,
            capacity,
            threshold,
            queue: Mutex::new(VecDeque::new()),
            health: Mutex::new(Health {
                fails: 0,
                working: true,
                failure_at: Instant::now(),
            }),
            dropped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    /// Enqueue one item; over capacity the oldest queued item is dropped.
    pub fn enqueue(&self, data: &SensorData) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if self.capacity > 0 && queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(data.clone());
    }

    /// Ship up to `batch_size` items.  Returns how many were shipped; zero
    /// with a non-empty queue means the exporter asked to back off.
    pub fn export_batch(&self) -> usize {
        let mut shipped = 0;

        loop {
            if self.batch_size > 0 && shipped >= self.batch_size {
                break;
            }
            let front = {
                let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.front().cloned()
            };
            let Some(data) = front else { break };

            match self.exporter.ship(&data) {
                Ok(true) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    self.queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pop_front();
                    shipped += 1;
                }
                Ok(false) => break,
                Err(e) => {
                    debug!(error = %e, "shipment failed");
                    self.fail();
                    return shipped;
                }
            }
        }

        if shipped > 0 {
            self.health.lock().unwrap_or_else(|e| e.into_inner()).working = true;
        }
        shipped
    }

    /// Whether the queue should be serviced now: non-empty, and either
    /// working or benched long enough.
    pub fn can_export(&self, dead_timeout: Duration) -> bool {
        if self.is_empty() {
            return false;
        }
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.working || health.failure_at.elapsed() >= dead_timeout
    }

    pub fn is_working(&self) -> bool {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).working
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn fail(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.working {
            health.fails += 1;
            if health.fails >= self.threshold {
                health.working = false;
                health.fails = 0;
                health.failure_at = Instant::now();
            }
        } else {
            health.failure_at = Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// QueuingDistributor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub dead_timeout: Duration,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub threshold: u32,
}

impl Default for DistributorConfig {
    fn default() -> DistributorConfig {
        DistributorConfig {
            dead_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            queue_capacity: 1000,
            batch_size: 30,
            threshold: 10,
        }
    }
}

/// Fans measured data out to all registered exporters and drives their
/// queues from a single worker thread.
pub struct QueuingDistributor {
    config: DistributorConfig,
    queues: Mutex<Vec<Arc<ExporterQueue>>>,
    new_data: Event,
    stop: StopControl,
}

impl QueuingDistributor {
    pub fn new(config: DistributorConfig) -> QueuingDistributor {
        QueuingDistributor {
            config,
            queues: Mutex::new(Vec::new()),
            new_data: Event::new(),
            stop: StopControl::new(),
        }
    }

    /// Wrap an exporter in a queue with the configured limits.
    pub fn register_exporter(&self, exporter: Arc<dyn Exporter>) {
        let queue = Arc::new(ExporterQueue::new(
            exporter,
            self.config.batch_size,
            self.config.queue_capacity,
            self.config.threshold,
        ));
        debug!(
            batch_size = self.config.batch_size,
            capacity = self.config.queue_capacity,
            threshold = self.config.threshold,
            "exporter queue created"
        );
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(queue);
    }

    /// Enqueue data into every exporter queue.
    pub fn export_data(&self, data: &SensorData) {
        if self.stop.should_stop() {
            return;
        }
        for queue in self.queues.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            queue.enqueue(data);
        }
        self.new_data.set();
    }

    /// Worker loop; call from a dedicated thread.
    pub fn run(&self) {
        info!("distributor started");

        while !self.stop.should_stop() {
            let queues: Vec<_> = self
                .queues
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            let mut cannot_export = 0;
            for queue in &queues {
                if queue.can_export(self.config.dead_timeout) {
                    if queue.export_batch() == 0 {
                        cannot_export += 1;
                    }
                } else {
                    cannot_export += 1;
                }
            }

            if cannot_export == queues.len() {
                self.new_data.try_wait(self.config.idle_timeout);
            }
        }

        info!("distributor stopped");
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name("distributor".into())
            .spawn(move || this.run())
            .expect("cannot spawn distributor thread")
    }

    pub fn stop(&self) {
        self.stop.request_stop();
        self.new_data.set();
    }

    pub fn queues(&self) -> Vec<Arc<ExporterQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
