//! Mapexport
//!
//! Off-screen export of an interactive map view into a print-ready raster,
//! embedded in a paginated document by a pluggable document renderer.
//!
//! The pipeline snapshots the live view, reproduces its layers on an
//! isolated surface (remote raster services are re-fetched as single static
//! images, vector layers are deep-cloned), waits for a complete draw pass,
//! composites every per-layer canvas into one raster by hand, verifies the
//! result is safe to read back, and synthesizes a cartographically correct
//! scale indicator.
//!
//! # Example
//!
//! ```no_run
//! use mapexport::{ExportConfig, Exporter, MapView, OffscreenContainer};
//!
//! # async fn run() -> mapexport::Result<()> {
//! let config = ExportConfig {
//!     proxy_url: Some("https://proxy.example.com/fetch?url=".to_string()),
//!     ..Default::default()
//! };
//!
//! let exporter = Exporter::new(config)?;
//! let view: MapView = serde_json::from_str(r#"{"center":[0,0],"resolution":10}"#)
//!     .map_err(|e| mapexport::Error::Other(e.to_string()))?;
//! let container = OffscreenContainer::new(1024, 768);
//! let frame = exporter.render_view(&view, &container).await?;
//! let png = frame.encode_png()?;
//! # let _ = png;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result, Stage};

pub mod geometry;
pub mod paper;
pub mod view;

// Layer reproduction (network fetch + decode, vector cloning)
pub mod reproduce;

// Off-screen surface assembly, draw synchronization, manual compositing
pub mod compose;
pub mod surface;
pub mod sync;
pub mod taint;

// Scale indicator synthesis
pub mod scale;

// Top-level staged orchestration
pub mod export;

pub use compose::CompositeFrame;
pub use export::{
    DocumentArtifact, DocumentJob, DocumentMetadata, DocumentRenderer, ExportArtifact,
    ExportRequest, Exporter, GridOptions, GridProvider, LegendAsset, LegendProvider, Providers,
};
pub use geometry::WorldExtent;
pub use paper::{MarginsPt, Orientation, PageSetup, PaperFormat, PaperSpec, PlacementBox};
pub use reproduce::{ExportLayer, FetchPolicy, LayerFailurePolicy};
pub use scale::{PollPolicy, ScaleBarReading, ScaleIndicatorSource, ScaleMode, ScaleResult};
pub use surface::{CleanSurface, LayerCanvas, EXPORT_ZOOM_FACTOR};
pub use view::{
    CrossOriginMode, Feature, FeatureStyle, Geometry, MapView, OffscreenContainer, Projection,
    SourceLayer, VectorSource, WmsSource,
};

use std::time::Duration;

/// Configuration for the export pipeline
///
/// The defaults are chosen to be conservative: three fetch attempts per
/// remote layer with a fixed delay, a one-frame settle tick after the draw
/// pass, and per-layer failures dropping only the affected layer.
///
/// # Examples
///
/// ```
/// let cfg = mapexport::ExportConfig::default();
/// assert_eq!(cfg.fetch_attempts, 3);
/// assert!(cfg.proxy_url.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// User agent string sent with map-image requests
    pub user_agent: String,
    /// Timeout for each HTTP request in milliseconds
    pub timeout_ms: u64,
    /// Fetch attempts per remote layer (at least 1)
    pub fetch_attempts: u32,
    /// Fixed delay between per-layer fetch attempts in milliseconds
    pub fetch_retry_delay_ms: u64,
    /// Proxy base URL; the target URL is percent-encoded and appended
    pub proxy_url: Option<String>,
    /// Backing-store density of the export surface canvases
    pub device_pixel_ratio: f32,
    /// Settle time after the draw-complete signal, in milliseconds
    pub frame_tick_ms: u64,
    /// Poll attempts for the live scale indicator
    pub scale_poll_attempts: u32,
    /// Fixed interval between scale-indicator polls in milliseconds
    pub scale_poll_interval_ms: u64,
    /// Whether a lost remote layer is dropped or aborts the render
    pub layer_failure: LayerFailurePolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("mapexport/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: 30000,
            fetch_attempts: 3,
            fetch_retry_delay_ms: 400,
            proxy_url: None,
            device_pixel_ratio: 1.0,
            frame_tick_ms: 16,
            scale_poll_attempts: 10,
            scale_poll_interval_ms: 50,
            layer_failure: LayerFailurePolicy::DropLayer,
        }
    }
}

impl ExportConfig {
    /// Per-layer fetch retry policy derived from this configuration.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            attempts: self.fetch_attempts,
            retry_delay: Duration::from_millis(self.fetch_retry_delay_ms),
            proxy_url: self.proxy_url.clone(),
        }
    }

    /// Scale-indicator poll policy derived from this configuration.
    pub fn scale_poll(&self) -> PollPolicy {
        PollPolicy {
            attempts: self.scale_poll_attempts,
            interval: Duration::from_millis(self.scale_poll_interval_ms),
        }
    }

    /// Post-draw settle tick.
    pub fn frame_tick(&self) -> Duration {
        Duration::from_millis(self.frame_tick_ms)
    }
}
