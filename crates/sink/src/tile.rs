use std::sync::{Arc, Mutex, MutexGuard};

use raster::{ImageDescriptor, Rect, Region};

slotmap::new_key_type! {
    pub(crate) struct TileId;
}

/// Grid position of a tile, keyed by the unclipped top-left corner. Two
/// tiles of one cache never share a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TilePos {
    pub left: i32,
    pub top: i32,
}

impl TilePos {
    pub fn of(area: Rect) -> Self {
        Self {
            left: area.left,
            top: area.top,
        }
    }
}

/// Floor-align `value` to the tile grid.
pub(crate) fn grid_origin(value: i32, step: u32) -> i32 {
    value.div_euclid(step as i32) * step as i32
}

/// Pixel storage for one tile.
///
/// Lives behind its own `Arc` so a worker thread can compute into it after
/// the cache lock is released. When a tile is rebound to a new area while a
/// worker still holds the old buffer, the tile gets a fresh buffer and the
/// worker's result is discarded on completion.
#[derive(Debug)]
pub(crate) struct TileBuffer {
    region: Mutex<Region>,
}

impl TileBuffer {
    pub fn new(descriptor: ImageDescriptor, area: Rect) -> Self {
        Self {
            region: Mutex::new(Region::new(descriptor, area)),
        }
    }

    pub fn region(&self) -> MutexGuard<'_, Region> {
        self.region.lock().expect("tile buffer lock poisoned")
    }

    /// Re-cover `area` in place. Callers must hold the only reference.
    pub fn rebind(&mut self, area: Rect) {
        self.region
            .get_mut()
            .expect("tile buffer lock poisoned")
            .rebind(area);
    }
}

/// One cell of the cache.
#[derive(Debug)]
pub(crate) struct Tile {
    /// The unclipped rectangle this tile covers; left/top are grid-aligned.
    pub area: Rect,
    /// The buffer holds the result of a completed compute for `area`.
    pub painted: bool,
    pub buffer: Arc<TileBuffer>,
    /// Owning cache's tick counter at last touch, for LRU eviction.
    pub ticks: u64,
    /// Producer generation the pixels were computed under.
    pub painted_generation: u64,
}

impl Tile {
    pub fn new(descriptor: ImageDescriptor, ticks: u64) -> Self {
        Self {
            area: Rect::new(0, 0, 0, 0),
            painted: false,
            buffer: Arc::new(TileBuffer::new(descriptor, Rect::new(0, 0, 0, 0))),
            ticks,
            painted_generation: 0,
        }
    }

    /// Whether the buffer may be served: painted and not invalidated since.
    pub fn is_valid(&self, source_generation: u64) -> bool {
        self.painted && self.painted_generation == source_generation
    }
}
