//! Suspends the export flow until the surface has finished drawing.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::surface::{CleanSurface, RenderHandle};

/// One compositor frame at 60 Hz.
pub const FRAME_TICK: Duration = Duration::from_millis(16);

/// Wait for the surface's one-shot draw-complete signal, then one extra
/// frame boundary.
///
/// Compositing work triggered by the completion signal is not guaranteed to
/// have been flushed to every layer canvas when the signal fires; the extra
/// tick lets it drain before anyone reads the canvases.
pub async fn await_draw_complete(handle: RenderHandle, frame_tick: Duration) -> Result<CleanSurface> {
    let surface = handle
        .rx
        .await
        .map_err(|_| Error::Other("render task dropped before signaling completion".into()))?;
    tokio::time::sleep(frame_tick).await;
    Ok(surface)
}
