//! Staged export orchestration.
//!
//! One call walks a linear pipeline: resolve the page, compute the extent,
//! optionally inject a grid overlay, render and composite the map (with one
//! immediate retry), synthesize the scale asset, collect legends, and hand
//! everything to the document renderer. Some stages are fatal, some degrade
//! with a logged warning; the grid overlay is disposed of exactly once on
//! every exit.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;

use crate::compose::{composite, CompositeFrame};
use crate::error::{Error, Result, Stage};
use crate::geometry::{view_extent_checked, WorldExtent};
use crate::paper::{Orientation, PageSetup, PaperSpec, PlacementBox};
use crate::reproduce::{reproduce_layers, reproduce_wms, ExportLayer, LayerFailurePolicy};
use crate::scale::{self, ScaleIndicatorSource, ScaleMode, ScaleResult};
use crate::surface::{build_clean_surface, start_render, EXPORT_ZOOM_FACTOR};
use crate::sync::await_draw_complete;
use crate::taint::assert_readable;
use crate::view::{CrossOriginMode, MapView, OffscreenContainer, SourceLayer};
use crate::ExportConfig;

/// The render stage runs at most this many passes per export: the first
/// attempt plus one immediate retry on an empty composite.
const RENDER_PASSES: u32 = 2;

/// Options forwarded to the grid-overlay collaborator.
#[derive(Debug, Clone)]
pub struct GridOptions {
    /// Fraction of the extent the grid bleeds past the printed edge.
    pub expand_by: f64,
    /// Preferred number of grid cells across the shorter edge.
    pub ideal_cells: u32,
    pub color: [u8; 4],
    pub width: f32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            expand_by: 0.05,
            ideal_cells: 5,
            color: [90, 90, 90, 180],
            width: 1.0,
        }
    }
}

/// Grid-overlay collaborator.
///
/// The orchestrator treats the returned layer as opaque and guarantees
/// `close_grid` runs exactly once for every export that requested a grid,
/// whether the export succeeds or fails.
pub trait GridProvider {
    fn make_grid(&self, extent: &WorldExtent, opts: &GridOptions) -> anyhow::Result<SourceLayer>;
    fn close_grid(&self);
}

/// One legend image provided by the host application.
#[derive(Debug, Clone)]
pub struct LegendAsset {
    pub title: String,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Legend collaborator; failures degrade to an empty legend list.
pub trait LegendProvider {
    fn legends_for_visible_layers(&self) -> anyhow::Result<Vec<LegendAsset>>;
}

/// Document metadata forwarded to the document renderer.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub dpi: u32,
    pub created_at: String,
    pub scale_label: Option<String>,
}

/// Everything the document renderer needs to lay out one page.
pub struct DocumentJob {
    /// The composited map as a `data:image/png;base64,...` URI.
    pub map_image: String,
    pub paper: Option<PaperSpec>,
    pub orientation: Orientation,
    pub placement: Option<PlacementBox>,
    pub scale: ScaleResult,
    pub legends: Vec<LegendAsset>,
    pub logo_url: Option<String>,
    pub metadata: DocumentMetadata,
    pub title: String,
    pub file_name: String,
}

/// What the document renderer hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentArtifact {
    pub download_url: String,
    pub file_name: String,
}

/// Document-layout collaborator. The pipeline has no knowledge of which
/// concrete layout template the implementation selects.
pub trait DocumentRenderer {
    fn render(&self, job: &DocumentJob) -> anyhow::Result<DocumentArtifact>;
}

/// Collaborators wired in by the host application for one export.
pub struct Providers<'a> {
    pub grid: Option<&'a dyn GridProvider>,
    pub legends: Option<&'a dyn LegendProvider>,
    pub scale_indicator: Option<&'a dyn ScaleIndicatorSource>,
    pub document: &'a dyn DocumentRenderer,
}

/// Parameters for one export call.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub title: String,
    pub page: PageSetup,
    pub show_grid: bool,
    pub grid: GridOptions,
    /// Extra overlay layers drawn on top of the snapshotted ones; owned by
    /// the export for the duration of the call.
    pub overlay_layers: Vec<SourceLayer>,
    pub include_legend: bool,
    pub scale_mode: ScaleMode,
    pub logo_url: Option<String>,
}

/// Successful export result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub download_url: String,
    pub file_name: String,
}

/// Turn a document title into a safe download file name: whitespace becomes
/// underscores, `.pdf` is appended.
pub fn sanitize_file_name(title: &str) -> String {
    let stem: String = title
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if stem.is_empty() {
        "map_export.pdf".to_string()
    } else {
        format!("{}.pdf", stem)
    }
}

/// Invokes `close_grid` exactly once when dropped, on every exit path.
struct GridGuard<'a> {
    provider: Option<&'a dyn GridProvider>,
}

impl Drop for GridGuard<'_> {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            provider.close_grid();
        }
    }
}

/// Drives the full export pipeline.
///
/// One instance owns the HTTP client and configuration; call
/// [`Exporter::export`] once per artifact. Overlapping calls against the
/// same container are unsupported and must be serialized by the caller.
pub struct Exporter {
    config: ExportConfig,
    client: Client,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run one export. Returns the artifact handed back by the document
    /// renderer, or the first fatal stage error.
    pub async fn export(
        &self,
        view: &MapView,
        container: &mut OffscreenContainer,
        request: &ExportRequest,
        providers: &Providers<'_>,
    ) -> Result<ExportArtifact> {
        // INIT
        if !view.has_content() {
            return Err(Error::at(Stage::Init, "no active map to export"));
        }

        // PAPER: resolve the page and size the container before anything
        // downstream reads its dimensions
        let page = request.page.resolve()?;
        container.set_size(page.viewport_px.0, page.viewport_px.1);

        // EXTENT: fails before any fetch or render call is made
        let extent = view_extent_checked(
            view.center,
            view.resolution.map(|r| r * EXPORT_ZOOM_FACTOR),
            container.width_px,
            container.height_px,
        )?;
        let export_resolution = extent.width() / f64::from(container.width_px);

        // GRID: the guard runs the disposal exactly once on every exit below
        let _grid_guard = GridGuard {
            provider: if request.show_grid { providers.grid } else { None },
        };
        let mut layers: Vec<SourceLayer> = view.layers.clone();
        layers.extend(request.overlay_layers.iter().cloned());
        if request.show_grid {
            if let Some(grid) = providers.grid {
                match grid.make_grid(&extent, &request.grid) {
                    Ok(layer) => layers.push(layer),
                    Err(e) => warn!("grid overlay unavailable, exporting without it: {}", e),
                }
            }
        }

        // RENDER_MAP
        let frame = self.render_with_retry(view, container, &extent, &layers).await?;
        let map_image = frame.into_data_uri()?;

        // SCALE
        let scale = scale::synthesize(
            request.scale_mode,
            export_resolution,
            view.projection.meters_per_unit,
            providers.scale_indicator,
            &self.config.scale_poll(),
        )
        .await?;
        if scale.png.is_empty() || scale.width_px == 0 {
            return Err(Error::at(Stage::Scale, "scale raster is empty"));
        }

        // SCALE_LABEL: best effort
        let scale_label = match scale::ratio_label(export_resolution, view.projection.meters_per_unit) {
            Ok(label) => Some(label),
            Err(e) => {
                warn!("scale label omitted: {}", e);
                None
            }
        };

        // LEGENDS: degrades to an empty list
        let legends = if request.include_legend {
            match providers.legends {
                Some(provider) => match provider.legends_for_visible_layers() {
                    Ok(list) => list,
                    Err(e) => {
                        warn!("legend provider failed, exporting without legends: {}", e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        // BUILD
        let file_name = sanitize_file_name(&request.title);
        let job = DocumentJob {
            map_image,
            paper: page.paper,
            orientation: page.orientation,
            placement: page.placement,
            scale,
            legends,
            logo_url: request.logo_url.clone(),
            metadata: DocumentMetadata {
                dpi: page.dpi,
                created_at: Utc::now().to_rfc3339(),
                scale_label,
            },
            title: request.title.clone(),
            file_name,
        };
        let artifact = providers
            .document
            .render(&job)
            .map_err(|e| Error::at(Stage::Build, e.to_string()))?;
        if artifact.download_url.is_empty() {
            return Err(Error::at(Stage::Build, "document renderer returned no URL"));
        }
        info!("export finished: {}", artifact.file_name);
        Ok(ExportArtifact {
            download_url: artifact.download_url,
            file_name: artifact.file_name,
        })
    }

    /// Render the view to a composite raster without building a document.
    /// Used by the CLI and by hosts that want the bare image.
    pub async fn render_view(
        &self,
        view: &MapView,
        container: &OffscreenContainer,
    ) -> Result<CompositeFrame> {
        let extent = view_extent_checked(
            view.center,
            view.resolution.map(|r| r * EXPORT_ZOOM_FACTOR),
            container.width_px,
            container.height_px,
        )?;
        self.render_with_retry(view, container, &extent, &view.layers).await
    }

    /// The render stage: attempt once, retry exactly once with no delay
    /// when the composite comes back empty, then fail fatally.
    async fn render_with_retry(
        &self,
        view: &MapView,
        container: &OffscreenContainer,
        extent: &WorldExtent,
        layers: &[SourceLayer],
    ) -> Result<CompositeFrame> {
        for pass in 1..=RENDER_PASSES {
            let frame = self.render_map(view, container, extent, layers).await?;
            if !frame.is_blank() {
                return Ok(frame);
            }
            debug!("render pass {} produced an empty composite", pass);
        }
        Err(Error::at(
            Stage::RenderMap,
            format!("composite still empty after {} passes", RENDER_PASSES),
        ))
    }

    /// One full render pass: reproduce the layers, draw them on the clean
    /// surface, synchronize, verify readback, composite.
    async fn render_map(
        &self,
        view: &MapView,
        container: &OffscreenContainer,
        extent: &WorldExtent,
        layers: &[SourceLayer],
    ) -> Result<CompositeFrame> {
        let fetch = self.config.fetch_policy();
        let mut reproduced: Vec<ExportLayer> = Vec::new();

        if let Some(base) = &view.base {
            // The base layer is always requested with readable settings
            let mut base = base.clone();
            base.cross_origin = CrossOriginMode::Anonymous;
            match reproduce_wms(
                &self.client,
                &base,
                &view.projection.srs,
                extent,
                container.width_px,
                container.height_px,
                &fetch,
                "base",
            )
            .await
            {
                Ok(image) => reproduced.push(ExportLayer::Raster(image)),
                Err(e) => match self.config.layer_failure {
                    LayerFailurePolicy::Abort => return Err(e),
                    LayerFailurePolicy::DropLayer => warn!("base layer dropped from export: {}", e),
                },
            }
        }

        let mut others = reproduce_layers(
            &self.client,
            layers,
            &view.projection.srs,
            extent,
            container.width_px,
            container.height_px,
            &fetch,
            self.config.layer_failure,
        )
        .await?;
        reproduced.append(&mut others);

        let surface = build_clean_surface(
            view.center,
            view.resolution,
            container,
            self.config.device_pixel_ratio,
        );
        let handle = start_render(surface, reproduced);
        let painted = await_draw_complete(handle, self.config.frame_tick()).await?;

        assert_readable(painted.canvases())?;
        composite(painted.canvases(), container.width_px, container.height_px)
    }
}
