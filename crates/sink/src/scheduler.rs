//! The dirty registry and its dispatch thread.
//!
//! Renders with pending tiles queue up here, sorted by priority at enqueue
//! time. A single dispatch thread takes the head, drives a worker pool over
//! its dirty list, and hands the render back if work remains. One process-
//! wide scheduler backs `sink_screen`; tests build private instances.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::pool;
use crate::render::{Render, RenderId};

struct RegistryEntry {
    id: RenderId,
    priority: i32,
    render: Weak<Render>,
}

pub(crate) struct Scheduler {
    /// Renders with pending work, highest priority first. Entries hold weak
    /// references; the registry never keeps a render alive.
    entries: Mutex<Vec<RegistryEntry>>,
    /// Advisory stop flag polled by pool allocation, so a fresh enqueue can
    /// preempt the running dispatch. Written without further ordering; a
    /// lost update costs at most one extra tile.
    reschedule: AtomicBool,
    /// One queued token per registry entry. The dispatch thread blocks on
    /// the receive side, which makes the channel the counting semaphore.
    work_sender: Sender<()>,
    work_receiver: Receiver<()>,
}

impl Scheduler {
    /// A scheduler with no dispatch thread. Work queues up until a test
    /// drains it by hand; production code wants [`Scheduler::start`].
    pub fn new() -> Arc<Self> {
        let (work_sender, work_receiver) = unbounded();
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            reschedule: AtomicBool::new(false),
            work_sender,
            work_receiver,
        })
    }

    /// A scheduler with its dispatch thread running.
    pub fn start() -> io::Result<Arc<Self>> {
        let scheduler = Self::new();
        scheduler.spawn_dispatcher()?;
        Ok(scheduler)
    }

    /// The process-wide scheduler, created on first use and kept for the
    /// process lifetime.
    pub fn global() -> io::Result<Arc<Self>> {
        static GLOBAL: OnceLock<Arc<Scheduler>> = OnceLock::new();
        if let Some(scheduler) = GLOBAL.get() {
            return Ok(Arc::clone(scheduler));
        }
        // Two threads may race to initialize; the loser's scheduler is
        // dropped below and its dispatch thread exits with it.
        let scheduler = Self::start()?;
        Ok(Arc::clone(GLOBAL.get_or_init(|| scheduler)))
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> io::Result<()> {
        let receiver = self.work_receiver.clone();
        let scheduler = Arc::downgrade(self);
        thread::Builder::new()
            .name("sink-dispatch".to_owned())
            .spawn(move || dispatch_loop(receiver, scheduler))?;
        Ok(())
    }

    /// Enqueue a render that has dirty tiles, keeping the registry sorted
    /// and waking the dispatcher. Re-publishing an enqueued render is a
    /// no-op. Callers hold the render lock; the registry lock nests inside.
    pub fn publish(&self, id: RenderId, priority: i32, render: Weak<Render>) {
        let mut entries = self.lock_entries();
        if entries.iter().any(|entry| entry.id == id) {
            return;
        }
        entries.insert(
            0,
            RegistryEntry {
                id,
                priority,
                render,
            },
        );
        // Stable sort: the fresh entry stays ahead of equal priorities.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.reschedule.store(true, Ordering::Relaxed);
        self.work_sender
            .send(())
            .expect("scheduler work channel disconnected");
    }

    /// Take the highest-priority pending render. `None` when a wake-up
    /// token outlived its entry, or the render died first.
    pub fn take_front(&self) -> Option<Arc<Render>> {
        let mut entries = self.lock_entries();
        if entries.is_empty() {
            return None;
        }
        let entry = entries.remove(0);
        entry.render.upgrade()
    }

    /// Drop a dying render's entry and the token that announced it, keeping
    /// token count equal to entry count.
    pub fn retire(&self, id: RenderId) {
        let mut entries = self.lock_entries();
        if let Some(index) = entries.iter().position(|entry| entry.id == id) {
            entries.remove(index);
            let _ = self.work_receiver.try_recv();
        }
    }

    pub fn request_reschedule(&self) {
        self.reschedule.store(true, Ordering::Relaxed);
    }

    pub fn clear_reschedule(&self) {
        self.reschedule.store(false, Ordering::Relaxed);
    }

    pub fn reschedule_requested(&self) -> bool {
        self.reschedule.load(Ordering::Relaxed)
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().expect("registry lock poisoned")
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.lock_entries().len()
    }

    /// Test stand-in for the dispatch thread's blocking receive.
    #[cfg(test)]
    pub fn recv_token(&self) {
        self.work_receiver
            .try_recv()
            .expect("a queued wake-up token");
    }

    #[cfg(test)]
    pub fn pending_tokens(&self) -> usize {
        self.work_receiver.len()
    }

    #[cfg(test)]
    pub fn entry_priorities(&self) -> Vec<i32> {
        self.lock_entries()
            .iter()
            .map(|entry| entry.priority)
            .collect()
    }
}

/// Body of the dispatch thread. Runs until its scheduler is dropped; the
/// process-wide scheduler never is.
fn dispatch_loop(receiver: Receiver<()>, scheduler: Weak<Scheduler>) {
    while receiver.recv().is_ok() {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        let Some(render) = scheduler.take_front() else {
            continue;
        };

        debug!("dispatching render {:?}", render.id());
        scheduler.clear_reschedule();
        pool::run(&render, &scheduler);

        // Hand the render back if the pool stopped early or new tiles were
        // queued while it ran.
        let still_dirty = !render.lock_state().dirty.is_empty();
        if still_dirty {
            render.publish();
        }

        // Dropping our reference may destroy the render.
    }
}
