//! Reconfiguration matrix.
//!
//! Decides which configuration aspects of each task group go stale when the
//! acquisition geometry changes. Pure function of the previous and next
//! geometry; settings mutators mark their own flags directly.

use crate::session::{AcquisitionSession, Roi};
use crate::tasks::Pending;

/// The acquisition values the configured tasks depend on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanGeometry {
    /// Pixel clock, in Hz
    pub pixel_rate: f64,
    /// Full-frame resolution
    pub resolution: usize,
    /// Zoom factor
    pub zoom: f64,
    /// Region of interest
    pub roi: Roi,
}

impl ScanGeometry {
    /// Snapshot a session's geometry.
    pub fn from_session(session: &dyn AcquisitionSession) -> Self {
        Self {
            pixel_rate: session.pixel_rate(),
            resolution: session.resolution(),
            zoom: session.zoom(),
            roi: session.roi(),
        }
    }
}

/// Flags to set on each task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Invalidations {
    /// Clock group
    pub clock: Pending,
    /// Scanner group
    pub scanner: Pending,
    /// Detector group
    pub detector: Pending,
}

impl Invalidations {
    /// Every aspect of every group.
    pub fn all() -> Self {
        Self {
            clock: Pending::all(),
            scanner: Pending::all(),
            detector: Pending::all(),
        }
    }

    /// Whether nothing is invalidated.
    pub fn is_empty(&self) -> bool {
        self.clock.is_empty() && self.scanner.is_empty() && self.detector.is_empty()
    }
}

/// Compute what `next` invalidates relative to `previous`.
///
/// With no previous geometry everything is stale.
pub fn invalidations(previous: Option<&ScanGeometry>, next: &ScanGeometry) -> Invalidations {
    let Some(prev) = previous else {
        return Invalidations::all();
    };
    let mut inv = Invalidations::default();

    if prev.pixel_rate != next.pixel_rate {
        inv.clock |= Pending::TIMING;
        inv.scanner |= Pending::TIMING;
        inv.detector |= Pending::TIMING;
    }
    if prev.resolution != next.resolution {
        inv.scanner |= Pending::TIMING | Pending::OUTPUT;
    }
    if prev.zoom != next.zoom {
        inv.clock |= Pending::OUTPUT;
        inv.scanner |= Pending::OUTPUT;
    }
    if (prev.roi.x, prev.roi.y) != (next.roi.x, next.roi.y) {
        inv.scanner |= Pending::OUTPUT;
    }
    if (prev.roi.width, prev.roi.height) != (next.roi.width, next.roi.height) {
        inv.clock |= Pending::TIMING | Pending::OUTPUT;
        inv.scanner |= Pending::TIMING | Pending::OUTPUT;
        inv.detector |= Pending::TIMING | Pending::CALLBACK;
    }
    inv
}
