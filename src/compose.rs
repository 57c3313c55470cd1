//! Merges per-layer canvases into one output raster.
//!
//! The rendering surface paints each layer onto its own canvas, positioned
//! through an affine transform with an independent container opacity. The
//! compositor reproduces that layered painting by hand into a single
//! fixed-size raster: z-order, transform, alpha and density correction.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tiny_skia::{Pixmap, PixmapPaint, Transform};

use crate::error::{Error, Result};
use crate::surface::LayerCanvas;

/// Fixed-size output raster of one composite pass.
///
/// Never mutated after creation; serialize it once with
/// [`CompositeFrame::into_data_uri`] or drop it.
pub struct CompositeFrame {
    width: u32,
    height: u32,
    pixmap: Pixmap,
}

impl CompositeFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when no layer contributed a single visible pixel.
    pub fn is_blank(&self) -> bool {
        self.pixmap.data().chunks_exact(4).all(|px| px[3] == 0)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<tiny_skia::PremultipliedColorU8> {
        self.pixmap.pixel(x, y)
    }

    /// Raw premultiplied RGBA bytes.
    pub fn data(&self) -> &[u8] {
        self.pixmap.data()
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        self.pixmap
            .encode_png()
            .map_err(|e| Error::Other(format!("png encode failed: {}", e)))
    }

    /// Serialize into a `data:image/png;base64,...` URI, consuming the frame.
    pub fn into_data_uri(self) -> Result<String> {
        let png = self.encode_png()?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    }
}

/// Merge every layer canvas into a fresh raster of the requested size.
///
/// Canvases paint in ascending stacking order with their own affine
/// transform and container opacity. A canvas whose backing store is denser
/// than its layout size is scaled back down by the inverse ratio, so one
/// output pixel always matches one layout pixel. Each call allocates a
/// fresh output raster; identical inputs produce identical pixels.
pub fn composite(canvases: &[LayerCanvas], width: u32, height: u32) -> Result<CompositeFrame> {
    let mut out = Pixmap::new(width, height)
        .ok_or_else(|| Error::Other(format!("invalid composite size {}x{}", width, height)))?;

    let mut order: Vec<&LayerCanvas> = canvases.iter().collect();
    // Stable sort: canvases sharing a z-index keep their attachment order
    order.sort_by_key(|canvas| canvas.z_index);

    for canvas in order {
        if canvas.backing_width() == 0 || canvas.backing_height() == 0 {
            continue;
        }
        let opacity = canvas.opacity.clamp(0.0, 1.0);
        if opacity == 0.0 {
            continue;
        }

        let mut transform = match canvas.transform {
            Some([a, b, c, d, e, f]) => Transform::from_row(a, b, c, d, e, f),
            None => Transform::identity(),
        };
        let ratio = canvas.pixel_ratio();
        if (ratio - 1.0).abs() > f32::EPSILON {
            transform = transform.pre_scale(1.0 / ratio, 1.0 / ratio);
        }

        let mut paint = PixmapPaint::default();
        paint.opacity = opacity;
        paint.quality = tiny_skia::FilterQuality::Bilinear;
        // The transform already carries the placement; paint at local origin
        out.draw_pixmap(0, 0, canvas.pixmap.as_ref(), &paint, transform, None);
    }

    Ok(CompositeFrame {
        width,
        height,
        pixmap: out,
    })
}
