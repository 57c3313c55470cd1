//! Readback safety check for layer canvases.

use crate::error::Result;
use crate::surface::LayerCanvas;

/// Probe every canvas with a 1x1 pixel readback.
///
/// Runs before the composite is serialized: a cross-origin-restricted
/// surface fails here with its own error variant, so a CORS or proxy
/// misconfiguration is never reported as an empty render. Canvases with no
/// backing pixels pass; emptiness is diagnosed after compositing.
pub fn assert_readable(canvases: &[LayerCanvas]) -> Result<()> {
    for canvas in canvases {
        if canvas.backing_width() == 0 || canvas.backing_height() == 0 {
            continue;
        }
        canvas.read_pixel(0, 0)?;
    }
    Ok(())
}
