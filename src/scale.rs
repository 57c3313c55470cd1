//! Scale indicator synthesis.
//!
//! Two paths produce the same result shape: reading the live map's own
//! indicator when one is present, or computing a synthetic indicator from
//! the view resolution and the projection's meters-per-unit.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tiny_skia::{Paint, Pixmap, Rect, Transform};

use crate::error::{Error, Result, Stage};

/// Standard OGC rendering pixel size in meters (0.28 mm).
pub const OGC_PIXEL_M: f64 = 0.000_28;

/// Target pixel width for the synthetic scale line.
const TARGET_LINE_PX: f64 = 100.0;

/// Pixel-width window for the segmented bar.
const BAR_MIN_PX: f64 = 80.0;
const BAR_MAX_PX: f64 = 180.0;

/// Fixed ascending table of cartographic scale denominators.
pub const SCALE_DENOMINATORS: [f64; 19] = [
    1_000.0,
    2_500.0,
    5_000.0,
    10_000.0,
    25_000.0,
    50_000.0,
    100_000.0,
    200_000.0,
    500_000.0,
    1_000_000.0,
    2_000_000.0,
    3_000_000.0,
    4_000_000.0,
    5_000_000.0,
    6_000_000.0,
    7_000_000.0,
    8_000_000.0,
    9_000_000.0,
    10_000_000.0,
];

/// Which indicator shape to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    /// A single line with end ticks and a distance label.
    #[default]
    Line,
    /// Alternating segments with a `1 : N` ratio label.
    Bar,
}

/// What the live scale indicator currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleBarReading {
    pub label: String,
    pub width_px: u32,
}

/// Access to the live map's own scale indicator, implemented by the host.
pub trait ScaleIndicatorSource {
    fn current(&self) -> Option<ScaleBarReading>;
}

/// Bounded poll loop parameters for the live indicator.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Finished scale asset: a raster glyph plus its printed label.
#[derive(Debug, Clone)]
pub struct ScaleResult {
    pub png: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
    pub label: String,
}

/// Meters represented by one pixel at the given view resolution.
pub fn meters_per_pixel(resolution: f64, meters_per_unit: f64) -> f64 {
    resolution * meters_per_unit
}

/// Round a distance to the nearest "nice" value of the form {1,2,5}x10^n.
pub fn nice_distance(raw_meters: f64) -> f64 {
    if !raw_meters.is_finite() || raw_meters <= 0.0 {
        return 1.0;
    }
    let exp = raw_meters.log10().floor();
    let base = 10f64.powf(exp);
    let norm = raw_meters / base;
    let nice = if norm < 2.0 {
        1.0
    } else if norm < 5.0 {
        2.0
    } else {
        5.0
    };
    nice * base
}

/// Snap a raw denominator to the table entry with the smallest absolute
/// difference. Non-positive or non-finite input snaps to the table minimum.
pub fn snap_denominator(raw: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return SCALE_DENOMINATORS[0];
    }
    let mut best = SCALE_DENOMINATORS[0];
    for &den in &SCALE_DENOMINATORS[1..] {
        if (raw - den).abs() < (raw - best).abs() {
            best = den;
        }
    }
    best
}

/// Human label for a distance in meters; switches to kilometers at 1000 m.
pub fn distance_label(meters: f64) -> String {
    if meters >= 1000.0 {
        let km = meters / 1000.0;
        if (km - km.round()).abs() < 1e-9 {
            format!("{} km", km.round() as i64)
        } else {
            format!("{} km", km)
        }
    } else if meters >= 1.0 && (meters - meters.round()).abs() < 1e-9 {
        format!("{} m", meters.round() as i64)
    } else {
        format!("{} m", meters)
    }
}

/// `1 : N` ratio label for the view, with `N` snapped to the denominator
/// table. Fails (and degrades upstream) when the view cannot yield a
/// meaningful ratio.
pub fn ratio_label(resolution: f64, meters_per_unit: f64) -> Result<String> {
    if !resolution.is_finite() || resolution <= 0.0 || !meters_per_unit.is_finite() || meters_per_unit <= 0.0
    {
        return Err(Error::at(
            Stage::ScaleLabel,
            format!(
                "cannot derive a scale ratio from resolution {} at {} m/unit",
                resolution, meters_per_unit
            ),
        ));
    }
    let raw = meters_per_pixel(resolution, meters_per_unit) / OGC_PIXEL_M;
    Ok(format!("1 : {}", snap_denominator(raw) as u64))
}

/// Poll the live indicator until it reports a usable reading or the
/// attempts run out.
pub async fn read_live_indicator(
    source: &dyn ScaleIndicatorSource,
    poll: &PollPolicy,
) -> Option<ScaleBarReading> {
    let attempts = poll.attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(reading) = source.current() {
            if !reading.label.is_empty() && reading.width_px > 0 {
                return Some(reading);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }
    None
}

/// Synthetic scale line derived from the view resolution.
pub fn synthesize_line(resolution: f64, meters_per_unit: f64) -> Result<ScaleResult> {
    let mpp = meters_per_pixel(resolution, meters_per_unit);
    if !mpp.is_finite() || mpp <= 0.0 {
        return Err(Error::at(
            Stage::Scale,
            format!("cannot derive meters per pixel from resolution {}", resolution),
        ));
    }
    let nice = nice_distance(TARGET_LINE_PX * mpp);
    let width_px = ((nice / mpp).round() as u32).max(1);
    draw_line_glyph(width_px, &distance_label(nice))
}

/// Rasterize a scale line of exactly `width_px` pixels.
pub fn draw_line_glyph(width_px: u32, label: &str) -> Result<ScaleResult> {
    let width_px = width_px.max(1);
    let height_px = 14u32;
    let mut pixmap = Pixmap::new(width_px, height_px)
        .ok_or_else(|| Error::at(Stage::Scale, format!("invalid glyph width {}", width_px)))?;

    let ink = solid_paint([51, 51, 51, 255]);
    // Baseline along the bottom edge
    if let Some(rect) = Rect::from_xywh(0.0, height_px as f32 - 3.0, width_px as f32, 2.0) {
        pixmap.fill_rect(rect, &ink, Transform::identity(), None);
    }
    // End ticks
    for x in [0.0, width_px as f32 - 2.0] {
        if let Some(rect) = Rect::from_xywh(x, 2.0, 2.0, height_px as f32 - 4.0) {
            pixmap.fill_rect(rect, &ink, Transform::identity(), None);
        }
    }

    let png = pixmap
        .encode_png()
        .map_err(|e| Error::at(Stage::Scale, format!("glyph encode failed: {}", e)))?;
    Ok(ScaleResult {
        png,
        width_px,
        height_px,
        label: label.to_string(),
    })
}

struct BarSpec {
    total_meters: f64,
    width_px: u32,
    segments: u32,
}

/// Pick a nice total length whose pixel width lands inside the bar window,
/// closest to the window midpoint.
fn bar_spec(mpp: f64) -> BarSpec {
    let midpoint = (BAR_MIN_PX + BAR_MAX_PX) / 2.0;
    let raw_mid = midpoint * mpp;
    let base = 10f64.powf(raw_mid.log10().floor());

    let mut best: Option<(f64, f64)> = None;
    for scale in [base / 10.0, base, base * 10.0] {
        for mult in [1.0, 2.0, 5.0] {
            let meters = scale * mult;
            let px = meters / mpp;
            if !(BAR_MIN_PX..=BAR_MAX_PX).contains(&px) {
                continue;
            }
            let dist = (px - midpoint).abs();
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((meters, dist));
            }
        }
    }

    let total_meters = best.map(|(m, _)| m).unwrap_or_else(|| nice_distance(raw_mid));
    BarSpec {
        total_meters,
        width_px: ((total_meters / mpp).round() as u32).max(1),
        segments: 4,
    }
}

/// Synthetic segmented bar with a `1 : N` ratio label.
pub fn synthesize_bar(resolution: f64, meters_per_unit: f64) -> Result<ScaleResult> {
    let mpp = meters_per_pixel(resolution, meters_per_unit);
    if !mpp.is_finite() || mpp <= 0.0 {
        return Err(Error::at(
            Stage::Scale,
            format!("cannot derive meters per pixel from resolution {}", resolution),
        ));
    }
    let spec = bar_spec(mpp);
    let label = format!("1 : {}", snap_denominator(mpp / OGC_PIXEL_M) as u64);
    draw_bar_glyph(&spec, &label)
}

fn draw_bar_glyph(spec: &BarSpec, label: &str) -> Result<ScaleResult> {
    let width_px = spec.width_px.max(spec.segments);
    let height_px = 12u32;
    let mut pixmap = Pixmap::new(width_px, height_px)
        .ok_or_else(|| Error::at(Stage::Scale, format!("invalid glyph width {}", width_px)))?;

    let dark = solid_paint([51, 51, 51, 255]);
    let light = solid_paint([245, 245, 245, 255]);
    let seg_w = width_px as f32 / spec.segments as f32;
    for i in 0..spec.segments {
        let paint = if i % 2 == 0 { &dark } else { &light };
        if let Some(rect) = Rect::from_xywh(i as f32 * seg_w, 1.0, seg_w, height_px as f32 - 2.0) {
            pixmap.fill_rect(rect, paint, Transform::identity(), None);
        }
    }
    // Thin frame around the whole bar
    let frame = solid_paint([51, 51, 51, 255]);
    for rect in [
        Rect::from_xywh(0.0, 0.0, width_px as f32, 1.0),
        Rect::from_xywh(0.0, height_px as f32 - 1.0, width_px as f32, 1.0),
        Rect::from_xywh(0.0, 0.0, 1.0, height_px as f32),
        Rect::from_xywh(width_px as f32 - 1.0, 0.0, 1.0, height_px as f32),
    ]
    .into_iter()
    .flatten()
    {
        pixmap.fill_rect(rect, &frame, Transform::identity(), None);
    }

    let png = pixmap
        .encode_png()
        .map_err(|e| Error::at(Stage::Scale, format!("glyph encode failed: {}", e)))?;
    Ok(ScaleResult {
        png,
        width_px,
        height_px,
        label: label.to_string(),
    })
}

/// Produce the scale asset for an export.
///
/// Line mode prefers the live indicator and falls back to a synthetic line;
/// bar mode is always synthetic since the live indicator has no segments.
pub async fn synthesize(
    mode: ScaleMode,
    resolution: f64,
    meters_per_unit: f64,
    indicator: Option<&dyn ScaleIndicatorSource>,
    poll: &PollPolicy,
) -> Result<ScaleResult> {
    match mode {
        ScaleMode::Line => {
            if let Some(source) = indicator {
                if let Some(reading) = read_live_indicator(source, poll).await {
                    debug!(
                        "using live scale indicator: {} ({}px)",
                        reading.label, reading.width_px
                    );
                    return draw_line_glyph(reading.width_px, &reading.label);
                }
            }
            synthesize_line(resolution, meters_per_unit)
        }
        ScaleMode::Bar => synthesize_bar(resolution, meters_per_unit),
    }
}

fn solid_paint(rgba: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]);
    paint
}
