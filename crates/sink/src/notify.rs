//! Cross-thread delivery of paint notifications.
//!
//! The paint callback runs on a worker thread and must not block. This ring
//! moves painted areas onto the consumer's own thread: pushes are lock-free
//! and lossy (oldest areas are evicted under pressure, which only means a
//! repaint covers them), and the consumer can sleep until areas arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use crossbeam_queue::ArrayQueue;
use raster::Rect;

// This ring is single-consumer by convention: producers are the pool
// threads, the consumer is whoever drains. The wake channel holds at most
// one token, so waking is idempotent.
struct SharedPaintRing {
    queue: ArrayQueue<Rect>,
    wake_sender: Sender<()>,
    wake_receiver: Receiver<()>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Producer half; clone freely, hand [`PaintSender::into_notify`] to
/// `sink_screen`.
#[derive(Clone)]
pub struct PaintSender {
    shared: Arc<SharedPaintRing>,
}

/// Consumer half.
pub struct PaintReceiver {
    shared: Arc<SharedPaintRing>,
}

/// A paint ring holding up to `capacity` pending areas.
pub fn paint_queue(capacity: usize) -> (PaintSender, PaintReceiver) {
    assert!(capacity > 0, "paint queue capacity must be greater than zero");
    let (wake_sender, wake_receiver) = bounded(1);
    let shared = Arc::new(SharedPaintRing {
        queue: ArrayQueue::new(capacity),
        wake_sender,
        wake_receiver,
        pushed: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        PaintSender {
            shared: Arc::clone(&shared),
        },
        PaintReceiver { shared },
    )
}

impl PaintSender {
    /// Record a painted area. When the ring is full the oldest area is
    /// evicted so the newest keeps flowing.
    pub fn push(&self, area: Rect) {
        let mut pending_area = area;
        loop {
            match self.shared.queue.push(pending_area) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    match self.shared.wake_sender.try_send(()) {
                        Ok(()) | Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            panic!("paint queue wake channel disconnected")
                        }
                    }
                    return;
                }
                Err(returned_area) => {
                    pending_area = returned_area;
                    // Under producer/consumer interleaving the area removed
                    // here may not be the globally oldest; any victim is fine
                    // for lossy delivery.
                    if self.shared.queue.pop().is_some() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Wrap this sender as the callback `sink_screen` expects.
    pub fn into_notify(self) -> crate::PaintNotify {
        Box::new(move |area| self.push(area))
    }

    pub fn pushed_areas(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped_areas(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl PaintReceiver {
    /// Drain up to `max_areas` pending areas into `output`, sleeping up to
    /// `wait_timeout` when the ring starts empty.
    ///
    /// Appends without clearing; the caller owns the vector's lifecycle.
    pub fn drain_with_wait(
        &self,
        output: &mut Vec<Rect>,
        max_areas: usize,
        wait_timeout: Duration,
    ) {
        if max_areas == 0 {
            return;
        }

        let mut drained_count = self.drain(output, max_areas);
        if drained_count > 0 || wait_timeout.is_zero() {
            return;
        }

        let wait_deadline = Instant::now() + wait_timeout;
        loop {
            let now = Instant::now();
            if now >= wait_deadline {
                return;
            }
            let remaining = wait_deadline.saturating_duration_since(now);
            match self.shared.wake_receiver.recv_timeout(remaining) {
                Ok(()) => {
                    drained_count += self.drain(output, max_areas - drained_count);
                    if drained_count > 0 {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("paint queue wake channel disconnected")
                }
            }
        }
    }

    fn drain(&self, output: &mut Vec<Rect>, max_areas: usize) -> usize {
        let mut drained_count = 0;
        while drained_count < max_areas {
            match self.shared.queue.pop() {
                Some(area) => {
                    output.push(area);
                    drained_count += 1;
                }
                None => break,
            }
        }
        drained_count
    }
}
