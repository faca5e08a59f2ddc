//! One cache instance: tile lookup, allocation, eviction, and the two fill
//! entry points.
//!
//! Every read or mutation of the tile structures happens under the single
//! `state` lock. The lock is deliberately coarse: the hot path is a region
//! fill, which already needs mutual exclusion against the worker pool's
//! tile allocation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use log::{debug, trace};
use raster::{ComputeError, ImageDescriptor, Pipeline, Rect, Region};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::scheduler::Scheduler;
use crate::tile::{grid_origin, Tile, TileBuffer, TileId, TilePos};
use crate::{PaintNotify, SinkScreenOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RenderId(u64);

fn next_render_id() -> RenderId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    RenderId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Tile structures of one cache, guarded by the render lock.
pub(crate) struct RenderState {
    /// Every tile the cache owns, for the cache's whole lifetime.
    pub tiles: SlotMap<TileId, Tile>,
    /// Position index over `tiles`.
    pub by_pos: HashMap<TilePos, TileId>,
    /// Unpainted tiles awaiting the worker pool, most recently queued first.
    pub dirty: VecDeque<TileId>,
    /// Bumped once per tile touch; the LRU clock.
    pub ticks: u64,
}

/// One cache instance bound to a producer.
///
/// Output handles and the dispatcher share a `Render` through `Arc`; the
/// instance dies when the last of them lets go.
pub(crate) struct Render {
    id: RenderId,
    source: Arc<dyn Pipeline>,
    descriptor: ImageDescriptor,
    options: SinkScreenOptions,
    concurrency: usize,
    notify: Option<PaintNotify>,
    scheduler: Arc<Scheduler>,
    weak_self: Weak<Render>,
    state: Mutex<RenderState>,
}

impl Render {
    pub fn new(
        source: Arc<dyn Pipeline>,
        options: SinkScreenOptions,
        notify: Option<PaintNotify>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        let descriptor = source.descriptor();
        let concurrency = match options.concurrency {
            0 => thread::available_parallelism().map_or(1, |workers| workers.get()),
            workers => workers,
        };
        Arc::new_cyclic(|weak_self| Self {
            id: next_render_id(),
            source,
            descriptor,
            options,
            concurrency,
            notify,
            scheduler: Arc::clone(&scheduler),
            weak_self: weak_self.clone(),
            state: Mutex::new(RenderState {
                tiles: SlotMap::with_key(),
                by_pos: HashMap::new(),
                dirty: VecDeque::new(),
                ticks: 0,
            }),
        })
    }

    pub fn id(&self) -> RenderId {
        self.id
    }

    pub fn source(&self) -> &Arc<dyn Pipeline> {
        &self.source
    }

    pub fn descriptor(&self) -> ImageDescriptor {
        self.descriptor
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn lock_state(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().expect("render lock poisoned")
    }

    /// Async mode paints in the background and reports through `notify`;
    /// without a callback every queued tile is computed in place.
    fn is_async(&self) -> bool {
        self.notify.is_some()
    }

    /// Hand this render to the dispatcher. Callers only publish while the
    /// dirty list is non-empty.
    pub fn publish(&self) {
        self.scheduler
            .publish(self.id, self.options.priority, self.weak_self.clone());
    }

    pub fn notify_painted(&self, area: Rect) {
        if let Some(notify) = &self.notify {
            notify(area);
        }
    }

    /// An output handle closed; jog the dispatcher so a stale reference is
    /// dropped promptly.
    pub fn on_output_closed(&self) {
        self.scheduler.request_reschedule();
    }

    /// Record a use of `tile_id`: snapshot the LRU clock and bump a queued
    /// tile to the front of the dirty list. A tile the pool has already
    /// taken out of the list is left alone.
    fn touch(&self, state: &mut RenderState, tile_id: TileId) {
        let ticks = state.ticks;
        state.ticks += 1;
        let tile = &mut state.tiles[tile_id];
        tile.ticks = ticks;
        if !tile.painted {
            if let Some(index) = state.dirty.iter().position(|&queued| queued == tile_id) {
                state.dirty.remove(index);
                state.dirty.push_front(tile_id);
            }
        }
    }

    /// Queue `tile_id` for calculation over `area`, moving it if needed.
    /// When relocating, the caller has already dropped the old position key.
    fn queue(&self, state: &mut RenderState, tile_id: TileId, area: Rect) -> Result<(), ComputeError> {
        trace!("queueing tile {},{}", area.left, area.top);

        let tile = &mut state.tiles[tile_id];
        tile.painted = false;
        tile.area = area;
        match Arc::get_mut(&mut tile.buffer) {
            Some(buffer) => buffer.rebind(area),
            None => {
                // A worker still computes into the old buffer; give the tile
                // a fresh one and let the stale result be discarded.
                tile.buffer = Arc::new(TileBuffer::new(self.descriptor, area));
            }
        }
        state.by_pos.insert(TilePos::of(area), tile_id);

        if self.is_async() {
            if let Some(index) = state.dirty.iter().position(|&queued| queued == tile_id) {
                state.dirty.remove(index);
            }
            state.dirty.push_front(tile_id);
            self.publish();
            Ok(())
        } else {
            let generation = self.source.generation();
            let tile = &mut state.tiles[tile_id];
            self.source.compute(&mut tile.buffer.region())?;
            tile.painted = true;
            tile.painted_generation = generation;
            Ok(())
        }
    }

    /// Serve the tile for `area`: a cache hit (re-queued if stale), a fresh
    /// tile if the cache may grow, or a reused one. `None` when every tile
    /// is pinned by pending work.
    fn request(&self, state: &mut RenderState, area: Rect) -> Result<Option<TileId>, ComputeError> {
        let tile_id = if let Some(&tile_id) = state.by_pos.get(&TilePos::of(area)) {
            let stale = {
                let tile = &state.tiles[tile_id];
                !tile.is_valid(self.source.generation())
            };
            if stale {
                self.queue(state, tile_id, area)?;
            }
            tile_id
        } else if self.options.max_tiles.allows(state.tiles.len()) {
            let ticks = state.ticks;
            let tile_id = state.tiles.insert(Tile::new(self.descriptor, ticks));
            debug!(
                "new tile {},{} ({} cached)",
                area.left,
                area.top,
                state.tiles.len()
            );
            self.queue(state, tile_id, area)?;
            tile_id
        } else {
            // Reuse a painted tile first: discarding cached pixels loses no
            // pending work. Failing that, take the oldest queued tile; the
            // front of the dirty list is what the consumer asked for last.
            let Some(tile_id) = Self::lru_painted(state).or_else(|| state.dirty.back().copied())
            else {
                return Ok(None);
            };
            let old = state.tiles[tile_id].area;
            debug!(
                "moving tile {},{} to {},{}",
                old.left, old.top, area.left, area.top
            );
            state.by_pos.remove(&TilePos::of(old));
            self.queue(state, tile_id, area)?;
            tile_id
        };

        self.touch(state, tile_id);
        Ok(Some(tile_id))
    }

    /// The painted tile with the oldest touch. A full scan, acceptable at
    /// the tile counts this cache is configured with.
    fn lru_painted(state: &RenderState) -> Option<TileId> {
        let mut best: Option<(TileId, u64)> = None;
        for (tile_id, tile) in &state.tiles {
            if !tile.painted {
                continue;
            }
            if best.map_or(true, |(_, best_ticks)| tile.ticks < best_ticks) {
                best = Some((tile_id, tile.ticks));
            }
        }
        best.map(|(tile_id, _)| tile_id)
    }

    /// Serve `out` from the cache. Pixels not yet painted read as zero and
    /// are queued for computation; in synchronous mode a producer failure
    /// surfaces here.
    pub fn fill_region(&self, out: &mut Region) -> Result<(), ComputeError> {
        let request = out.rect();
        if request.is_empty() {
            return Ok(());
        }
        trace!(
            "region fill {},{} {}x{}",
            request.left,
            request.top,
            request.width,
            request.height
        );

        let mut state = self.lock_state();
        for area in self.grid_areas(request) {
            match self.request(&mut state, area)? {
                Some(tile_id) => {
                    let tile = &state.tiles[tile_id];
                    if tile.is_valid(self.source.generation()) {
                        out.copy_from(&tile.buffer.region());
                    } else {
                        out.paint(area, 0);
                    }
                }
                None => out.paint(area, 0),
            }
        }
        Ok(())
    }

    /// Write per-tile coverage into `out`: 255 where the tile is painted and
    /// valid, 0 elsewhere. Lookup only; observing coverage must not create
    /// demand.
    pub fn fill_mask(&self, out: &mut Region) {
        let request = out.rect();
        if request.is_empty() {
            return;
        }

        let state = self.lock_state();
        for area in self.grid_areas(request) {
            let valid = state
                .by_pos
                .get(&TilePos::of(area))
                .is_some_and(|&tile_id| state.tiles[tile_id].is_valid(self.source.generation()));
            out.paint(area, if valid { 255 } else { 0 });
        }
    }

    /// The grid of tile areas intersecting `request`, row-major.
    fn grid_areas(&self, request: Rect) -> SmallVec<[Rect; 8]> {
        let tile_width = self.options.tile_width;
        let tile_height = self.options.tile_height;
        let mut areas = SmallVec::new();
        let mut y = grid_origin(request.top, tile_height);
        while y < request.bottom() {
            let mut x = grid_origin(request.left, tile_width);
            while x < request.right() {
                areas.push(Rect::new(x, y, tile_width, tile_height));
                x += tile_width as i32;
            }
            y += tile_height as i32;
        }
        areas
    }
}

impl Drop for Render {
    fn drop(&mut self) {
        // Output closure implies no further fills, so nobody can observe the
        // registry entry this removes.
        self.scheduler.retire(self.id);
    }
}
