//! The worker pool one dispatch drives over a render's dirty tiles.
//!
//! Workers compute outside the render lock; a job pins the tile's buffer
//! through its own `Arc`, and the result is committed only if the tile still
//! carries that buffer for that area when the compute finishes. A tile
//! evicted mid-flight therefore costs a wasted compute, never a mis-paint.

use std::sync::Arc;
use std::thread;

use log::{trace, warn};
use raster::Rect;

use crate::render::Render;
use crate::scheduler::Scheduler;
use crate::tile::{TileBuffer, TileId};

pub(crate) struct TileJob {
    tile_id: TileId,
    area: Rect,
    buffer: Arc<TileBuffer>,
    /// Producer generation sampled before computing; the pixels are stamped
    /// with it so an invalidation during the compute still reads as stale.
    generation: u64,
}

/// Drain `render`'s dirty list until it is empty or a reschedule is asked.
pub(crate) fn run(render: &Arc<Render>, scheduler: &Scheduler) {
    let workers = render.concurrency();
    if workers <= 1 {
        worker_loop(render, scheduler);
        return;
    }
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker_loop(render, scheduler));
        }
    });
}

fn worker_loop(render: &Arc<Render>, scheduler: &Scheduler) {
    while let Some(job) = allocate(render, scheduler) {
        work(render, job);
    }
}

/// Claim the next dirty tile, or stop the worker: either the list drained or
/// a higher-priority render wants the dispatcher back.
pub(crate) fn allocate(render: &Arc<Render>, scheduler: &Scheduler) -> Option<TileJob> {
    let mut state = render.lock_state();
    if scheduler.reschedule_requested() {
        return None;
    }
    let tile_id = state.dirty.pop_front()?;
    let tile = &state.tiles[tile_id];
    Some(TileJob {
        tile_id,
        area: tile.area,
        buffer: Arc::clone(&tile.buffer),
        generation: render.source().generation(),
    })
}

pub(crate) fn work(render: &Arc<Render>, job: TileJob) {
    trace!("computing tile {},{}", job.area.left, job.area.top);
    let computed = {
        let mut region = job.buffer.region();
        render.source().compute(&mut region)
    };
    match computed {
        Ok(()) => complete(render, job),
        Err(error) => {
            // The tile stays unpainted: it reads as zero, the mask reports
            // it missing, and the next consumer request retries it.
            warn!(
                "background compute for tile {},{} failed: {error}",
                job.area.left, job.area.top
            );
        }
    }
}

/// Commit a finished compute and tell the consumer. A tile that was rebound
/// while the worker ran keeps a different buffer, so the stale result is
/// dropped here.
fn complete(render: &Arc<Render>, job: TileJob) {
    let painted_area = {
        let mut state = render.lock_state();
        match state.tiles.get_mut(job.tile_id) {
            Some(tile)
                if Arc::ptr_eq(&tile.buffer, &job.buffer)
                    && tile.area == job.area
                    && !tile.painted =>
            {
                tile.painted = true;
                tile.painted_generation = job.generation;
                Some(tile.area)
            }
            _ => None,
        }
    };
    if let Some(area) = painted_area {
        render.notify_painted(area);
    }
}
