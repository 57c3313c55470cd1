//! World-space extent math.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Stage};

/// Axis-aligned bounding rectangle in map-CRS units.
///
/// Extents produced by [`view_extent`] are always symmetric around the
/// source center, with `min < max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldExtent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl WorldExtent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
            && self.min_x < self.max_x
            && self.min_y < self.max_y
    }

    /// A copy grown by `factor` of its own size on every side (0.05 grows
    /// the extent by 5% per side). Used when an overlay should bleed past
    /// the printed edge.
    pub fn expanded(&self, factor: f64) -> WorldExtent {
        let dx = self.width() * factor;
        let dy = self.height() * factor;
        WorldExtent::new(self.min_x - dx, self.min_y - dy, self.max_x + dx, self.max_y + dy)
    }

    /// Comma-joined `minx,miny,maxx,maxy` as expected by GetMap `BBOX`.
    pub fn bbox_param(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// World-space extent covering `width_px` x `height_px` pixels centered on
/// `center` at `resolution` world units per pixel.
pub fn view_extent(center: (f64, f64), resolution: f64, width_px: u32, height_px: u32) -> WorldExtent {
    let half_w = resolution * f64::from(width_px) / 2.0;
    let half_h = resolution * f64::from(height_px) / 2.0;
    WorldExtent::new(
        center.0 - half_w,
        center.1 - half_h,
        center.0 + half_w,
        center.1 + half_h,
    )
}

/// Same as [`view_extent`], but fails when the live view has not produced a
/// center or resolution yet. This runs before any network or render call so
/// an uninitialized map aborts the export with nothing else started.
pub fn view_extent_checked(
    center: Option<(f64, f64)>,
    resolution: Option<f64>,
    width_px: u32,
    height_px: u32,
) -> Result<WorldExtent> {
    let center = center.ok_or_else(|| Error::at(Stage::Extent, "map center is unavailable"))?;
    let resolution =
        resolution.ok_or_else(|| Error::at(Stage::Extent, "map resolution is unavailable"))?;
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(Error::at(
            Stage::Extent,
            format!("invalid map resolution {}", resolution),
        ));
    }
    Ok(view_extent(center, resolution, width_px, height_px))
}
