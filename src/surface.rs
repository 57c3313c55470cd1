//! Off-screen render surface assembly and the per-layer draw pass.
//!
//! The surface is an isolated clone of the live view: same center, fixed
//! zoom-in factor, no interaction handlers, no controls. Every hosted layer
//! draws onto its own canvas; merging those canvases into one raster is the
//! compositor's job, not the surface's.

use log::debug;
use tiny_skia::{FillRule, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform};
use tokio::sync::oneshot;

use crate::geometry::{view_extent, WorldExtent};
use crate::reproduce::{ExportLayer, StaticImage};
use crate::view::{Feature, Geometry, OffscreenContainer};

/// Fixed zoom-in applied to the export surface so printed maps read at a
/// sharper effective scale than the interactive viewport.
pub const EXPORT_ZOOM_FACTOR: f64 = 0.65;

/// One per-layer drawing surface attached to the render viewport.
#[derive(Clone)]
pub struct LayerCanvas {
    pub pixmap: Pixmap,
    /// 2-D affine placement `(a, b, c, d, e, f)`; identity when `None`.
    pub transform: Option<[f32; 6]>,
    /// Effective opacity of the canvas container.
    pub opacity: f32,
    /// Stacking order; higher draws later, i.e. on top.
    pub z_index: i32,
    /// Layout width in CSS pixels; differs from the backing width on
    /// high-density output.
    pub layout_width: u32,
    /// False when the content came from an unapproved cross-origin source.
    pub origin_clean: bool,
    pub name: String,
}

impl LayerCanvas {
    pub fn backing_width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn backing_height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Ratio of backing-store pixels to layout pixels.
    pub fn pixel_ratio(&self) -> f32 {
        if self.layout_width == 0 {
            1.0
        } else {
            self.pixmap.width() as f32 / self.layout_width as f32
        }
    }

    /// Pixel readback probe. A surface whose content came from an
    /// unapproved cross-origin source refuses to be read, mirroring
    /// `getImageData` semantics.
    pub fn read_pixel(&self, x: u32, y: u32) -> crate::error::Result<Option<tiny_skia::PremultipliedColorU8>> {
        if !self.origin_clean {
            return Err(crate::error::Error::Tainted(self.name.clone()));
        }
        Ok(self.pixmap.pixel(x, y))
    }
}

/// Isolated, non-interactive render surface cloned from the live view.
pub struct CleanSurface {
    pub center: (f64, f64),
    pub resolution: f64,
    pub extent: WorldExtent,
    pub width_px: u32,
    pub height_px: u32,
    pub device_pixel_ratio: f32,
    canvases: Vec<LayerCanvas>,
}

impl CleanSurface {
    /// Surface for a view that was not available: valid, but hosts nothing.
    /// Callers must check for emptiness downstream.
    pub fn empty(width_px: u32, height_px: u32) -> Self {
        Self {
            center: (0.0, 0.0),
            resolution: 1.0,
            extent: view_extent((0.0, 0.0), 1.0, width_px.max(1), height_px.max(1)),
            width_px,
            height_px,
            device_pixel_ratio: 1.0,
            canvases: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.canvases.is_empty()
    }

    pub fn canvases(&self) -> &[LayerCanvas] {
        &self.canvases
    }
}

/// Build the export surface from the live view's position.
///
/// The container must be sized before this is called; its dimensions drive
/// the extent, every layer canvas, and the final composite. When the live
/// map has no position yet this still returns a minimal valid surface
/// instead of failing.
pub fn build_clean_surface(
    center: Option<(f64, f64)>,
    resolution: Option<f64>,
    container: &OffscreenContainer,
    device_pixel_ratio: f32,
) -> CleanSurface {
    let (Some(center), Some(resolution)) = (center, resolution) else {
        debug!("live map unavailable, building empty surface");
        return CleanSurface::empty(container.width_px, container.height_px);
    };
    let resolution = resolution * EXPORT_ZOOM_FACTOR;
    let extent = view_extent(center, resolution, container.width_px, container.height_px);
    CleanSurface {
        center,
        resolution,
        extent,
        width_px: container.width_px,
        height_px: container.height_px,
        device_pixel_ratio: device_pixel_ratio.max(0.1),
        canvases: Vec::new(),
    }
}

/// Resolves with the painted surface once the draw pass completes.
pub struct RenderHandle {
    pub(crate) rx: oneshot::Receiver<CleanSurface>,
}

/// Kick off the surface's draw pass.
///
/// Painting runs off the async flow; the handle's one-shot signal fires
/// when the engine has finished one full pass over all hosted layers.
pub fn start_render(surface: CleanSurface, layers: Vec<ExportLayer>) -> RenderHandle {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let painted = paint_layers(surface, layers);
        let _ = tx.send(painted);
    });
    RenderHandle { rx }
}

fn paint_layers(mut surface: CleanSurface, layers: Vec<ExportLayer>) -> CleanSurface {
    let dpr = surface.device_pixel_ratio;
    let backing_w = ((surface.width_px as f32 * dpr).round() as u32).max(1);
    let backing_h = ((surface.height_px as f32 * dpr).round() as u32).max(1);

    for (z, layer) in layers.into_iter().enumerate() {
        if !layer.visible() {
            debug!("skipping hidden layer {}", layer.name());
            continue;
        }
        let Some(mut pixmap) = Pixmap::new(backing_w, backing_h) else {
            continue;
        };
        let (opacity, origin_clean, name) = match &layer {
            ExportLayer::Raster(image) => (image.opacity, image.origin_clean, image.name.clone()),
            ExportLayer::Vector(overlay) => (overlay.opacity, true, overlay.name.clone()),
        };
        match &layer {
            ExportLayer::Raster(image) => paint_static_image(&mut pixmap, &surface.extent, image),
            ExportLayer::Vector(overlay) => {
                paint_features(&mut pixmap, &surface.extent, &overlay.features)
            }
        }
        surface.canvases.push(LayerCanvas {
            pixmap,
            transform: None,
            opacity,
            z_index: z as i32,
            layout_width: surface.width_px,
            origin_clean,
            name,
        });
    }
    surface
}

/// Draw a georeferenced static image into a layer canvas, mapping the
/// image's world extent into the surface's pixel space.
fn paint_static_image(canvas: &mut Pixmap, surface_extent: &WorldExtent, image: &StaticImage) {
    let img_w = image.pixmap.width();
    let img_h = image.pixmap.height();
    if img_w == 0 || img_h == 0 || !surface_extent.is_valid() {
        return;
    }
    let cw = f64::from(canvas.width());
    let ch = f64::from(canvas.height());
    let sx = image.extent.width() / surface_extent.width() * cw / f64::from(img_w);
    let sy = image.extent.height() / surface_extent.height() * ch / f64::from(img_h);
    let tx = (image.extent.min_x - surface_extent.min_x) / surface_extent.width() * cw;
    let ty = (surface_extent.max_y - image.extent.max_y) / surface_extent.height() * ch;

    let mut paint = PixmapPaint::default();
    paint.quality = tiny_skia::FilterQuality::Bilinear;
    canvas.draw_pixmap(
        0,
        0,
        image.pixmap.as_ref(),
        &paint,
        Transform::from_row(sx as f32, 0.0, 0.0, sy as f32, tx as f32, ty as f32),
        None,
    );
}

/// Draw cloned vector features into a layer canvas.
fn paint_features(canvas: &mut Pixmap, extent: &WorldExtent, features: &[Feature]) {
    if !extent.is_valid() {
        return;
    }
    let cw = f64::from(canvas.width());
    let ch = f64::from(canvas.height());
    let to_px = |p: &[f64; 2]| -> (f32, f32) {
        (
            ((p[0] - extent.min_x) / extent.width() * cw) as f32,
            ((extent.max_y - p[1]) / extent.height() * ch) as f32,
        )
    };

    for feature in features {
        let style = &feature.style;
        match &feature.geometry {
            Geometry::Point(p) => {
                let (x, y) = to_px(p);
                let mut pb = PathBuilder::new();
                pb.push_circle(x, y, style.point_radius.max(0.5));
                let Some(path) = pb.finish() else { continue };
                if let Some(fill) = style.fill {
                    canvas.fill_path(
                        &path,
                        &solid_paint(fill),
                        FillRule::Winding,
                        Transform::identity(),
                        None,
                    );
                }
                canvas.stroke_path(
                    &path,
                    &solid_paint(style.stroke),
                    &stroke_of(style.stroke_width),
                    Transform::identity(),
                    None,
                );
            }
            Geometry::Line(points) => {
                let Some(path) = polyline_path(points, &to_px, false) else { continue };
                canvas.stroke_path(
                    &path,
                    &solid_paint(style.stroke),
                    &stroke_of(style.stroke_width),
                    Transform::identity(),
                    None,
                );
            }
            Geometry::Polygon(ring) => {
                let Some(path) = polyline_path(ring, &to_px, true) else { continue };
                if let Some(fill) = style.fill {
                    canvas.fill_path(
                        &path,
                        &solid_paint(fill),
                        FillRule::Winding,
                        Transform::identity(),
                        None,
                    );
                }
                canvas.stroke_path(
                    &path,
                    &solid_paint(style.stroke),
                    &stroke_of(style.stroke_width),
                    Transform::identity(),
                    None,
                );
            }
        }
    }
}

fn polyline_path(
    points: &[[f64; 2]],
    to_px: &dyn Fn(&[f64; 2]) -> (f32, f32),
    close: bool,
) -> Option<tiny_skia::Path> {
    if points.len() < 2 {
        return None;
    }
    let mut pb = PathBuilder::new();
    let (x0, y0) = to_px(&points[0]);
    pb.move_to(x0, y0);
    for p in &points[1..] {
        let (x, y) = to_px(p);
        pb.line_to(x, y);
    }
    if close {
        pb.close();
    }
    pb.finish()
}

fn solid_paint(rgba: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]);
    paint.anti_alias = true;
    paint
}

fn stroke_of(width: f32) -> Stroke {
    Stroke {
        width: width.max(0.1),
        ..Stroke::default()
    }
}
