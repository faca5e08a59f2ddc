use std::fmt;

use crate::{ImageDescriptor, Region};

/// An upstream pixel producer.
///
/// `compute` fills the region it is handed with the source pixels for the
/// region's rectangle. It is called concurrently from worker threads, each
/// with its own region, and may be arbitrarily slow.
///
/// A producer whose pixels can change invalidates downstream caches by
/// bumping `generation`; pixels computed under an older generation must no
/// longer be served as valid.
pub trait Pipeline: Send + Sync {
    fn descriptor(&self) -> ImageDescriptor;

    fn compute(&self, region: &mut Region) -> Result<(), ComputeError>;

    /// Monotonic invalidation counter. The default never invalidates.
    fn generation(&self) -> u64 {
        0
    }
}

/// Failure reported by a `Pipeline` while computing pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeError {
    pub message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "pixel computation failed: {}", self.message)
    }
}

impl std::error::Error for ComputeError {}
