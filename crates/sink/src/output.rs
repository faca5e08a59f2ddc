//! Pull-based output handles.
//!
//! A `ScreenImage` and its optional `MaskImage` are the two consumers of one
//! cache instance. Dropping a handle is the close notification; the cache
//! dies when every handle and the dispatcher have let go.

use std::sync::Arc;

use raster::{ComputeError, ImageDescriptor, Region};

use crate::render::Render;

/// The main output: serves cached pixels for any requested rectangle.
pub struct ScreenImage {
    render: Arc<Render>,
}

impl ScreenImage {
    pub(crate) fn new(render: Arc<Render>) -> Self {
        Self { render }
    }

    /// The upstream producer's descriptor.
    pub fn descriptor(&self) -> ImageDescriptor {
        self.render.descriptor()
    }

    /// Fill `out` with whatever the cache holds for its rectangle.
    ///
    /// Never blocks on the producer in asynchronous mode: missing tiles are
    /// queued for the background pool and read as zero until painted. In
    /// synchronous mode missing tiles are computed in place and a producer
    /// failure surfaces here.
    pub fn fill(&self, out: &mut Region) -> Result<(), ComputeError> {
        assert_eq!(
            out.descriptor().bytes_per_pixel(),
            self.render.descriptor().bytes_per_pixel(),
            "output region pixel layout must match the source image"
        );
        self.render.fill_region(out)
    }

    /// Attach a coverage mask over the same cache.
    pub fn mask(&self) -> MaskImage {
        MaskImage {
            render: Arc::clone(&self.render),
        }
    }
}

impl Drop for ScreenImage {
    fn drop(&mut self) {
        self.render.on_output_closed();
    }
}

/// Coverage output: 255 per pixel where the main output currently holds
/// valid pixels for that tile, 0 elsewhere.
pub struct MaskImage {
    render: Arc<Render>,
}

impl MaskImage {
    /// One 8-bit band over the source extent.
    pub fn descriptor(&self) -> ImageDescriptor {
        self.render.descriptor().mask()
    }

    /// Fill `out` with coverage bits. Reading the mask never queues work.
    pub fn fill(&self, out: &mut Region) {
        assert_eq!(
            out.descriptor().bytes_per_pixel(),
            1,
            "mask regions are one 8-bit band"
        );
        self.render.fill_mask(out);
    }
}

impl Drop for MaskImage {
    fn drop(&mut self) {
        self.render.on_output_closed();
    }
}
