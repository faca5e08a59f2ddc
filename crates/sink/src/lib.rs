//! Asynchronous screen-sink cache.
//!
//! `sink_screen` puts a tile cache between a slow pixel producer and an
//! interactive consumer. Reads return immediately with whatever pixels the
//! cache holds; missing tiles are queued and painted by a background worker
//! pool, and a coverage mask reports which tiles are currently valid.
//!
//! Internal architecture overview:
//! - `tile`: one cache cell and its pixel buffer.
//! - `render`: one cache instance; lookup, allocation, LRU eviction, fills.
//! - `scheduler`: the process-wide dirty registry and dispatch thread.
//! - `pool`: the worker pool one dispatch drives over a render's dirty tiles.
//! - `output`: the pull-based screen and mask handles.
//! - `notify`: a lossy cross-thread queue for paint notifications.

use std::fmt;
use std::io;
use std::sync::Arc;

use raster::{Pipeline, Rect};

pub use notify::{paint_queue, PaintReceiver, PaintSender};
pub use output::{MaskImage, ScreenImage};

use render::Render;
use scheduler::Scheduler;

mod notify;
mod output;
mod pool;
mod render;
mod scheduler;
mod tile;

/// Paint-completion callback, invoked from a worker thread each time a tile
/// transitions to painted.
///
/// The callback must not block and must not call back into the cache; hosts
/// that need the event on their own thread can push it through the queue
/// returned by [`paint_queue`].
pub type PaintNotify = Box<dyn Fn(Rect) + Send + Sync>;

/// Cache size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTiles {
    Unlimited,
    Bounded(usize),
}

impl MaxTiles {
    pub(crate) fn allows(self, cached_tiles: usize) -> bool {
        match self {
            MaxTiles::Unlimited => true,
            MaxTiles::Bounded(limit) => cached_tiles < limit,
        }
    }
}

/// Configuration for one cache instance. Immutable after `sink_screen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkScreenOptions {
    pub tile_width: u32,
    pub tile_height: u32,
    pub max_tiles: MaxTiles,
    /// Larger numbers are dispatched sooner; fixed at creation.
    pub priority: i32,
    /// Worker threads per dispatch; 0 picks the available parallelism.
    pub concurrency: usize,
}

impl Default for SinkScreenOptions {
    fn default() -> Self {
        Self {
            tile_width: 128,
            tile_height: 128,
            max_tiles: MaxTiles::Bounded(256),
            priority: 0,
            concurrency: 0,
        }
    }
}

impl SinkScreenOptions {
    fn validate(&self) -> Result<(), SinkScreenError> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(SinkScreenError::InvalidTileSize {
                width: self.tile_width,
                height: self.tile_height,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SinkScreenError {
    InvalidTileSize { width: u32, height: u32 },
    DispatcherSpawn(io::Error),
}

impl fmt::Display for SinkScreenError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkScreenError::InvalidTileSize { width, height } => {
                write!(
                    formatter,
                    "tile dimensions must be positive, got {width}x{height}"
                )
            }
            SinkScreenError::DispatcherSpawn(error) => {
                write!(formatter, "failed to spawn dispatch thread: {error}")
            }
        }
    }
}

impl std::error::Error for SinkScreenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkScreenError::InvalidTileSize { .. } => None,
            SinkScreenError::DispatcherSpawn(error) => Some(error),
        }
    }
}

/// Build a screen sink over `source`.
///
/// The returned [`ScreenImage`] serves cached pixels on demand; attach a
/// [`MaskImage`] with [`ScreenImage::mask`] to observe per-tile coverage.
///
/// With `notify` set the cache runs asynchronously: fills never wait on the
/// producer, and `notify` fires from a worker thread as tiles are painted.
/// Without it the cache is synchronous and every fill computes its missing
/// tiles in place.
pub fn sink_screen(
    source: Arc<dyn Pipeline>,
    options: SinkScreenOptions,
    notify: Option<PaintNotify>,
) -> Result<ScreenImage, SinkScreenError> {
    let scheduler = Scheduler::global().map_err(SinkScreenError::DispatcherSpawn)?;
    sink_screen_on(scheduler, source, options, notify)
}

/// As `sink_screen`, but on a caller-supplied scheduler. Tests use this to
/// keep scenarios off the process-wide dispatch thread.
pub(crate) fn sink_screen_on(
    scheduler: Arc<Scheduler>,
    source: Arc<dyn Pipeline>,
    options: SinkScreenOptions,
    notify: Option<PaintNotify>,
) -> Result<ScreenImage, SinkScreenError> {
    options.validate()?;
    Ok(ScreenImage::new(Render::new(
        source, options, notify, scheduler,
    )))
}
