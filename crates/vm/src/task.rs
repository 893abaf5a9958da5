//! Task runtime: registry, mailboxes, futures and the bounded thread
//! pool.
//!
//! Each task owns its execution context and mailbox; the runtime only
//! tracks handles, routes messages and manages shared worker resources.
//! Messaging is the sole cross-task ordering mechanism: a send
//! happens-before the corresponding accept returns.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use fugue_extension::ExtensionRegistry;

use crate::value::{StrId, TaskId, Value, VmType};

/// A message queued in a task's mailbox.
#[derive(Clone, Debug)]
pub struct Message {
    pub sender: TaskId,
    pub name: StrId,
    pub payload: Vec<Value>,
}

impl Message {
    fn matches(&self, name: StrId, payload_types: &[VmType]) -> bool {
        self.name == name
            && self.payload.len() == payload_types.len()
            && self
                .payload
                .iter()
                .zip(payload_types)
                .all(|(value, ty)| value.vm_type() == *ty)
    }
}

/// Unbounded FIFO of inbound messages with blocking, pattern-matched
/// dequeue. Mismatching messages ahead of a match stay in place; later
/// accepts may still claim them.
pub struct Mailbox {
    queue: Mutex<std::collections::VecDeque<Message>>,
    signal: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            queue: Mutex::new(std::collections::VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    pub fn deliver(&self, message: Message) {
        self.queue.lock().push_back(message);
        self.signal.notify_all();
    }

    /// Dequeue the first message matching name + payload types, blocking
    /// until one arrives.
    pub fn accept(&self, name: StrId, payload_types: &[VmType]) -> Message {
        let mut queue = self.queue.lock();
        loop {
            if let Some(pos) = queue.iter().position(|m| m.matches(name, payload_types)) {
                return queue.remove(pos).expect("position just found");
            }
            self.signal.wait(&mut queue);
        }
    }

    /// Dequeue the first message matching any of the given patterns,
    /// returning the pattern index alongside the message.
    pub fn accept_any(&self, patterns: &[(StrId, Vec<VmType>)]) -> (usize, Message) {
        let mut queue = self.queue.lock();
        loop {
            let hit = queue.iter().enumerate().find_map(|(pos, m)| {
                patterns
                    .iter()
                    .position(|(name, types)| m.matches(*name, types))
                    .map(|entry| (pos, entry))
            });
            if let Some((pos, entry)) = hit {
                let message = queue.remove(pos).expect("position just found");
                return (entry, message);
            }
            self.signal.wait(&mut queue);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-once cell with blocking reads. The spawning computation writes
/// exactly once; reads after the write all observe the same value.
pub struct FutureCell {
    value: Mutex<Option<Value>>,
    ready: Condvar,
}

impl FutureCell {
    pub fn new() -> Self {
        FutureCell {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn set(&self, value: Value) {
        let mut slot = self.value.lock();
        if slot.is_some() {
            log::warn!("future written more than once; keeping the first value");
            return;
        }
        *slot = Some(value);
        self.ready.notify_all();
    }

    /// Block until the future resolves.
    pub fn get(&self) -> Value {
        let mut slot = self.value.lock();
        while slot.is_none() {
            self.ready.wait(&mut slot);
        }
        slot.clone().expect("checked above")
    }

    pub fn try_get(&self) -> Option<Value> {
        self.value.lock().clone()
    }
}

impl Default for FutureCell {
    fn default() -> Self {
        Self::new()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded FIFO worker pool. Submission blocks when the queue is full;
/// each worker runs one body to completion before pulling the next.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity.max(1));
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fugue-pool-{}", id))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn pool worker");
            handles.push(handle);
        }
        ThreadPool {
            tx: Some(tx),
            workers: handles,
        }
    }

    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // Blocks only when the bounded queue is saturated.
            let _ = tx.send(job);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct TaskRecord {
    mailbox: Arc<Mailbox>,
    join: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

/// Shared task runtime. One per program execution.
pub struct TaskRuntime {
    tasks: DashMap<u32, TaskRecord>,
    names: DashMap<StrId, TaskId>,
    next: AtomicU32,
    pool: Mutex<Option<ThreadPool>>,
    pub extensions: Arc<ExtensionRegistry>,
}

impl TaskRuntime {
    pub fn new(extensions: Arc<ExtensionRegistry>) -> Arc<Self> {
        Arc::new(TaskRuntime {
            tasks: DashMap::new(),
            names: DashMap::new(),
            next: AtomicU32::new(1),
            pool: Mutex::new(None),
            extensions,
        })
    }

    /// Allocate a task handle and its mailbox. The caller runs the body
    /// (inline for the main task, on a thread or pool worker for forks).
    pub fn register_task(&self) -> (TaskId, Arc<Mailbox>) {
        let id = TaskId(self.next.fetch_add(1, Ordering::Relaxed));
        let mailbox = Arc::new(Mailbox::new());
        self.tasks.insert(
            id.0,
            TaskRecord {
                mailbox: Arc::clone(&mailbox),
                join: Mutex::new(None),
                finished: AtomicBool::new(false),
            },
        );
        (id, mailbox)
    }

    pub fn attach_join(&self, task: TaskId, handle: JoinHandle<()>) {
        if let Some(record) = self.tasks.get(&task.0) {
            *record.join.lock() = Some(handle);
        }
    }

    pub fn mailbox(&self, task: TaskId) -> Option<Arc<Mailbox>> {
        self.tasks.get(&task.0).map(|r| Arc::clone(&r.mailbox))
    }

    /// Deliver a message; sends to unknown or finished tasks are
    /// silently dropped.
    pub fn send(&self, to: TaskId, message: Message) {
        if let Some(record) = self.tasks.get(&to.0) {
            record.mailbox.deliver(message);
        } else {
            log::debug!("message to unknown task {:?} dropped", to);
        }
    }

    pub fn register_name(&self, name: StrId, task: TaskId) {
        self.names.insert(name, task);
    }

    pub fn lookup_name(&self, name: StrId) -> Option<TaskId> {
        self.names.get(&name).map(|t| *t)
    }

    pub fn mark_finished(&self, task: TaskId) {
        if let Some(record) = self.tasks.get(&task.0) {
            record.finished.store(true, Ordering::Release);
        }
    }

    pub fn is_finished(&self, task: TaskId) -> bool {
        self.tasks
            .get(&task.0)
            .map(|r| r.finished.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    pub fn create_pool(&self, workers: usize, queue_capacity: usize) {
        let mut pool = self.pool.lock();
        if pool.is_none() {
            log::debug!("creating thread pool with {} workers", workers);
            *pool = Some(ThreadPool::new(workers, queue_capacity));
        }
    }

    pub fn has_pool(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Submit to the pool. Returns false when no pool exists; the caller
    /// falls back to a dedicated thread.
    pub fn submit_to_pool(&self, job: Job) -> bool {
        let pool = self.pool.lock();
        match &*pool {
            Some(pool) => {
                pool.submit(job);
                true
            }
            None => false,
        }
    }

    /// Join every forked task. Called once by the engine after the main
    /// task completes.
    pub fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .iter()
            .filter_map(|record| record.join.lock().take())
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        // Tear down the pool so its workers drain and exit.
        *self.pool.lock() = None;
    }
}
