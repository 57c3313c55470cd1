//! Snapshot types describing the live map view.
//!
//! The export pipeline never touches the interactive map directly. The host
//! application snapshots what is currently displayed into a [`MapView`] and
//! hands that to the exporter, which reproduces the layers off-screen.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Coordinate reference system parameters the pipeline needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// SRS code sent with map-image requests, e.g. `EPSG:3857`.
    pub srs: String,
    /// Meters represented by one map unit at the equator.
    pub meters_per_unit: f64,
}

impl Projection {
    /// EPSG:3857 spherical mercator.
    pub fn web_mercator() -> Self {
        Self {
            srs: "EPSG:3857".to_string(),
            meters_per_unit: 1.0,
        }
    }
}

impl Default for Projection {
    fn default() -> Self {
        Projection::web_mercator()
    }
}

/// How a remote image source is requested with respect to CORS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossOriginMode {
    /// Anonymous CORS request: the resulting surface stays pixel-readable,
    /// but the server must grant access or the load fails.
    #[default]
    Anonymous,
    /// Plain request: always loads, but the surface it is drawn onto can no
    /// longer be read back.
    Plain,
}

/// A remote map-image service layer as configured on the live map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WmsSource {
    pub endpoint: String,
    /// Comma-separated layer names for the `LAYERS` parameter.
    pub layers: String,
    /// SRS override; the view projection is used when absent.
    #[serde(default)]
    pub srs: Option<String>,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub cross_origin: CrossOriginMode,
}

fn default_opacity() -> f32 {
    1.0
}

fn default_visible() -> bool {
    true
}

/// Vector feature geometry in map-CRS coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Point([f64; 2]),
    Line(Vec<[f64; 2]>),
    Polygon(Vec<[f64; 2]>),
}

/// Per-feature draw style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStyle {
    pub stroke: [u8; 4],
    pub stroke_width: f32,
    pub fill: Option<[u8; 4]>,
    pub point_radius: f32,
}

impl Default for FeatureStyle {
    fn default() -> Self {
        Self {
            stroke: [51, 51, 51, 255],
            stroke_width: 1.5,
            fill: Some([255, 255, 255, 102]),
            point_radius: 4.0,
        }
    }
}

/// One drawable feature with its style and custom properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: Geometry,
    #[serde(default)]
    pub style: FeatureStyle,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A vector layer as configured on the live map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSource {
    pub features: Vec<Feature>,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

/// One layer of the live map, snapshotted for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLayer {
    Wms(WmsSource),
    Vector(VectorSource),
    /// Anything the export pipeline cannot reproduce; dropped silently.
    Unsupported { kind: String },
}

/// Point-in-time snapshot of the interactive map.
///
/// `center` and `resolution` are optional because a map that has not
/// finished initializing has neither; the pipeline fails fast in that case.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapView {
    pub center: Option<(f64, f64)>,
    pub resolution: Option<f64>,
    #[serde(default)]
    pub projection: Projection,
    /// Background imagery; always requested with anonymous CORS so the
    /// export surface stays readable.
    #[serde(default)]
    pub base: Option<WmsSource>,
    #[serde(default)]
    pub layers: Vec<SourceLayer>,
}

impl MapView {
    /// Whether the map has anything to export at all.
    pub fn has_content(&self) -> bool {
        self.base.is_some() || !self.layers.is_empty()
    }
}

/// Off-screen element the export surface is mounted into.
///
/// The container must be sized before the surface is built, and it must keep
/// real (non-zero) layout metrics while an export is running; pixel readback
/// depends on it. The pipeline documents this contract but does not enforce
/// it. The same container is reused across sequential exports; overlapping
/// exports would fight over its size and are unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OffscreenContainer {
    pub width_px: u32,
    pub height_px: u32,
}

impl OffscreenContainer {
    pub fn new(width_px: u32, height_px: u32) -> Self {
        Self { width_px, height_px }
    }

    pub fn set_size(&mut self, width_px: u32, height_px: u32) {
        self.width_px = width_px;
        self.height_px = height_px;
    }

    pub fn is_zero_sized(&self) -> bool {
        self.width_px == 0 || self.height_px == 0
    }
}
