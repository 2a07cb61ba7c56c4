//! The packet-processing threadpool.
//!
//! Workers block on a condvar over the shared [`PriorityQueue`], process
//! exactly one packet at a time and report dependency start/finish around
//! the handler call. Handler panics and errors never unwind past the
//! worker loop.

use crate::packet::PacketData;
use crate::priority_queue::PriorityQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Above this backlog, incoming sync requests are refused rather than
/// queued (the requester is disconnected, the node stays healthy).
pub const MAX_QUEUE_SIZE_TO_DROP_SYNCING: usize = 20_000;

/// Processes one packet; called from worker threads.
pub trait PacketProcessor: Send + Sync {
    fn process(&self, packet: PacketData);
}

struct Shared {
    queue: Mutex<PriorityQueue>,
    work_available: Condvar,
    stopped: AtomicBool,
}

pub struct PacketsThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    workers_count: usize,
}

impl PacketsThreadPool {
    pub fn new(workers_count: usize) -> Self {
        let workers_count = workers_count.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(PriorityQueue::new(workers_count)),
                work_available: Condvar::new(),
                stopped: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
            workers_count,
        }
    }

    /// Spawn the worker threads against `processor`.
    pub fn start(&self, processor: Arc<dyn PacketProcessor>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("threadpool already started");
            return;
        }
        for index in 0..self.workers_count {
            let shared = self.shared.clone();
            let processor = processor.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("packets-{index}"))
                    .spawn(move || worker_loop(shared, processor))
                    .expect("worker thread spawns"),
            );
        }
        info!(workers = self.workers_count, "packet threadpool started");
    }

    /// Enqueue a received packet.
    pub fn push(&self, packet: PacketData) {
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(packet);
        }
        self.shared.work_available.notify_one();
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop accepting work and join the workers; each drains the packet it
    /// is currently executing, nothing more.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.work_available.notify_all();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                warn!("packet worker panicked during shutdown");
            }
        }
        info!("packet threadpool stopped");
    }
}

fn worker_loop(shared: Arc<Shared>, processor: Arc<dyn PacketProcessor>) {
    loop {
        let packet = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(packet) = queue.pop() {
                    queue.update_dependencies_start(&packet);
                    break packet;
                }
                shared.work_available.wait(&mut queue);
            }
        };

        // Handler failures are contained; the catch keeps a poisoned
        // handler from taking the worker down with it.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            processor.process(packet.clone());
        }));
        if result.is_err() {
            debug!(packet_type = ?packet.packet_type, "packet handler panicked");
        }

        {
            let mut queue = shared.queue.lock();
            queue.update_dependencies_finish(&packet);
        }
        // Finishing may unblock packets other workers were waiting on.
        shared.work_available.notify_all();
    }
}
