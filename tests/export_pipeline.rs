//! Integration tests for the staged export pipeline, driven against a
//! local stub map-image server and stub collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tiny_http::{Response, Server};

use mapexport::{
    DocumentArtifact, DocumentJob, DocumentRenderer, Error, ExportConfig, ExportRequest, Exporter,
    Feature, FeatureStyle, Geometry, GridOptions, GridProvider, MapView, MarginsPt,
    OffscreenContainer, Orientation, PageSetup, PaperFormat, Projection, Providers,
    ScaleBarReading, ScaleIndicatorSource, ScaleMode, SourceLayer, Stage, VectorSource,
    WmsSource, WorldExtent,
};

struct StubResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    allow_origin: bool,
}

impl StubResponse {
    fn png(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "image/png",
            body,
            allow_origin: true,
        }
    }
}

/// Spawn a map-image stub server. The responder sees the 0-based request
/// index; the returned counter tracks how many requests arrived.
fn spawn_wms<F>(responder: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize) -> StubResponse + Send + 'static,
{
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr();
    let endpoint = format!("http://{}/wms", addr);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let n = hits_clone.fetch_add(1, Ordering::SeqCst);
            let stub = responder(n);
            let mut response = Response::from_data(stub.body).with_status_code(stub.status);
            response.add_header(
                format!("Content-Type: {}", stub.content_type)
                    .parse::<tiny_http::Header>()
                    .unwrap(),
            );
            if stub.allow_origin {
                response.add_header(
                    "Access-Control-Allow-Origin: *"
                        .parse::<tiny_http::Header>()
                        .unwrap(),
                );
            }
            let _ = request.respond(response);
        }
    });

    (endpoint, hits)
}

fn png_solid(rgba: [u8; 4]) -> Vec<u8> {
    let mut pixmap = tiny_skia::Pixmap::new(8, 8).unwrap();
    pixmap.fill(tiny_skia::Color::from_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]));
    pixmap.encode_png().unwrap()
}

fn png_transparent() -> Vec<u8> {
    tiny_skia::Pixmap::new(8, 8).unwrap().encode_png().unwrap()
}

fn wms_layer(endpoint: &str) -> SourceLayer {
    SourceLayer::Wms(WmsSource {
        endpoint: endpoint.to_string(),
        layers: "topo:base".to_string(),
        srs: None,
        opacity: 1.0,
        visible: true,
        cross_origin: Default::default(),
    })
}

fn marker_layer() -> SourceLayer {
    SourceLayer::Vector(VectorSource {
        features: vec![Feature {
            geometry: Geometry::Point([0.0, 0.0]),
            style: FeatureStyle::default(),
            properties: Default::default(),
        }],
        opacity: 1.0,
        visible: true,
    })
}

fn test_view(layers: Vec<SourceLayer>) -> MapView {
    MapView {
        center: Some((0.0, 0.0)),
        resolution: Some(10.0),
        projection: Projection::web_mercator(),
        base: None,
        layers,
    }
}

fn test_config() -> ExportConfig {
    ExportConfig {
        timeout_ms: 5000,
        fetch_retry_delay_ms: 1,
        frame_tick_ms: 1,
        scale_poll_interval_ms: 1,
        ..Default::default()
    }
}

fn letter_landscape_request(title: &str) -> ExportRequest {
    ExportRequest {
        title: title.to_string(),
        page: PageSetup::Paper {
            format: PaperFormat::Letter,
            orientation: Orientation::Landscape,
            margins: MarginsPt::uniform(36.0),
            dpi: 150,
        },
        show_grid: false,
        grid: GridOptions::default(),
        overlay_layers: Vec::new(),
        include_legend: false,
        scale_mode: ScaleMode::Line,
        logo_url: None,
    }
}

#[derive(Clone)]
struct CapturedJob {
    file_name: String,
    scale_label: Option<String>,
    dpi: u32,
    legend_count: usize,
}

#[derive(Default)]
struct CapturingDoc {
    last_job: Mutex<Option<CapturedJob>>,
}

impl DocumentRenderer for CapturingDoc {
    fn render(&self, job: &DocumentJob) -> anyhow::Result<DocumentArtifact> {
        *self.last_job.lock().unwrap() = Some(CapturedJob {
            file_name: job.file_name.clone(),
            scale_label: job.metadata.scale_label.clone(),
            dpi: job.metadata.dpi,
            legend_count: job.legends.len(),
        });
        Ok(DocumentArtifact {
            download_url: format!("blob:{}", job.file_name),
            file_name: job.file_name.clone(),
        })
    }
}

struct FailingLegends;

impl mapexport::LegendProvider for FailingLegends {
    fn legends_for_visible_layers(&self) -> anyhow::Result<Vec<mapexport::LegendAsset>> {
        anyhow::bail!("legend service unreachable")
    }
}

/// A document renderer that comes back without a URL.
struct NoUrlDoc;

impl DocumentRenderer for NoUrlDoc {
    fn render(&self, job: &DocumentJob) -> anyhow::Result<DocumentArtifact> {
        Ok(DocumentArtifact {
            download_url: String::new(),
            file_name: job.file_name.clone(),
        })
    }
}

struct CountingIndicator {
    calls: AtomicUsize,
}

impl ScaleIndicatorSource for CountingIndicator {
    fn current(&self) -> Option<ScaleBarReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(ScaleBarReading {
            label: "100 m".into(),
            width_px: 96,
        })
    }
}

#[derive(Default)]
struct CountingGrid {
    made: AtomicUsize,
    closed: AtomicUsize,
}

impl GridProvider for CountingGrid {
    fn make_grid(&self, extent: &WorldExtent, opts: &GridOptions) -> anyhow::Result<SourceLayer> {
        self.made.fetch_add(1, Ordering::SeqCst);
        let (cx, cy) = extent.center();
        Ok(SourceLayer::Vector(VectorSource {
            features: vec![
                Feature {
                    geometry: Geometry::Line(vec![[extent.min_x, cy], [extent.max_x, cy]]),
                    style: FeatureStyle {
                        stroke: opts.color,
                        stroke_width: opts.width,
                        fill: None,
                        point_radius: 1.0,
                    },
                    properties: Default::default(),
                },
                Feature {
                    geometry: Geometry::Line(vec![[cx, extent.min_y], [cx, extent.max_y]]),
                    style: FeatureStyle {
                        stroke: opts.color,
                        stroke_width: opts.width,
                        fill: None,
                        point_radius: 1.0,
                    },
                    properties: Default::default(),
                },
            ],
            opacity: 1.0,
            visible: true,
        }))
    }

    fn close_grid(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn providers<'a>(doc: &'a dyn DocumentRenderer) -> Providers<'a> {
    Providers {
        grid: None,
        legends: None,
        scale_indicator: None,
        document: doc,
    }
}

#[tokio::test]
async fn end_to_end_letter_landscape_export() {
    let (endpoint, hits) = spawn_wms(|_| StubResponse::png(png_solid([30, 90, 160, 255])));
    let view = test_view(vec![wms_layer(&endpoint), marker_layer()]);

    let doc = CapturingDoc::default();
    let indicator = CountingIndicator {
        calls: AtomicUsize::new(0),
    };
    let mut ports = providers(&doc);
    ports.scale_indicator = Some(&indicator);

    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let artifact = exporter
        .export(&view, &mut container, &letter_landscape_request("Harbor Approach Chart"), &ports)
        .await
        .unwrap();

    assert_eq!(artifact.file_name, "Harbor_Approach_Chart.pdf");
    assert!(artifact.download_url.starts_with("blob:"));

    // Paper stage sized the container from Letter landscape at 150 dpi
    assert_eq!((container.width_px, container.height_px), (1500, 1125));

    // The scale-line provider was queried exactly once
    assert_eq!(indicator.calls.load(Ordering::SeqCst), 1);

    // One render pass, one layer fetch
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let job = doc.last_job.lock().unwrap().clone().unwrap();
    assert_eq!(job.file_name, "Harbor_Approach_Chart.pdf");
    assert_eq!(job.dpi, 150);
    assert!(job.scale_label.unwrap().starts_with("1 : "));
}

#[tokio::test]
async fn legend_provider_failure_degrades_to_an_empty_list() {
    let (endpoint, _hits) = spawn_wms(|_| StubResponse::png(png_solid([70, 110, 40, 255])));
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = CapturingDoc::default();
    let legends = FailingLegends;
    let mut ports = providers(&doc);
    ports.legends = Some(&legends);

    let mut request = letter_landscape_request("legends");
    request.include_legend = true;

    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    exporter
        .export(&view, &mut container, &request, &ports)
        .await
        .unwrap();

    let job = doc.last_job.lock().unwrap().clone().unwrap();
    assert_eq!(job.legend_count, 0);
}

#[tokio::test]
async fn unusable_projection_degrades_the_ratio_label_only() {
    let (endpoint, _hits) = spawn_wms(|_| StubResponse::png(png_solid([20, 20, 200, 255])));
    let mut view = test_view(vec![wms_layer(&endpoint)]);
    view.projection = Projection {
        srs: "EPSG:3857".into(),
        meters_per_unit: 0.0,
    };

    // The live indicator keeps the scale stage alive; only the ratio label
    // computation has nothing to work with
    let doc = CapturingDoc::default();
    let indicator = CountingIndicator {
        calls: AtomicUsize::new(0),
    };
    let mut ports = providers(&doc);
    ports.scale_indicator = Some(&indicator);

    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    exporter
        .export(&view, &mut container, &letter_landscape_request("nolabel"), &ports)
        .await
        .unwrap();

    let job = doc.last_job.lock().unwrap().clone().unwrap();
    assert!(job.scale_label.is_none());
}

#[tokio::test]
async fn missing_center_fails_the_extent_stage_with_zero_fetches() {
    let (endpoint, hits) = spawn_wms(|_| StubResponse::png(png_solid([0, 0, 0, 255])));
    let mut view = test_view(vec![wms_layer(&endpoint)]);
    view.center = None;

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(&view, &mut container, &letter_landscape_request("t"), &providers(&doc))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Extent));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(doc.last_job.lock().unwrap().is_none());
}

#[tokio::test]
async fn empty_view_fails_the_init_stage() {
    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(
            &MapView::default(),
            &mut container,
            &letter_landscape_request("t"),
            &providers(&doc),
        )
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Init));
}

#[tokio::test]
async fn render_retries_once_after_a_blank_first_pass() {
    // First GetMap returns a fully transparent image, second an opaque one
    let (endpoint, hits) = spawn_wms(|n| {
        if n == 0 {
            StubResponse::png(png_transparent())
        } else {
            StubResponse::png(png_solid([200, 60, 20, 255]))
        }
    });
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let artifact = exporter
        .export(&view, &mut container, &letter_landscape_request("retry"), &providers(&doc))
        .await
        .unwrap();

    assert_eq!(artifact.file_name, "retry.pdf");
    // The render routine ran exactly twice: one fetch per pass
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistently_blank_render_is_fatal() {
    let (endpoint, hits) = spawn_wms(|_| StubResponse::png(png_transparent()));
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(&view, &mut container, &letter_landscape_request("blank"), &providers(&doc))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::RenderMap));
    assert!(matches!(err, Error::StageFailed { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(doc.last_job.lock().unwrap().is_none());
}

#[tokio::test]
async fn grid_is_closed_exactly_once_on_success() {
    let (endpoint, _hits) = spawn_wms(|_| StubResponse::png(png_solid([10, 10, 10, 255])));
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = CapturingDoc::default();
    let grid = CountingGrid::default();
    let mut ports = providers(&doc);
    ports.grid = Some(&grid);

    let mut request = letter_landscape_request("gridded");
    request.show_grid = true;

    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    exporter
        .export(&view, &mut container, &request, &ports)
        .await
        .unwrap();

    assert_eq!(grid.made.load(Ordering::SeqCst), 1);
    assert_eq!(grid.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn grid_is_closed_exactly_once_on_fatal_error() {
    let (endpoint, _hits) = spawn_wms(|_| StubResponse::png(png_solid([10, 10, 10, 255])));
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = NoUrlDoc;
    let grid = CountingGrid::default();
    let mut ports = providers(&doc);
    ports.grid = Some(&grid);

    let mut request = letter_landscape_request("doomed");
    request.show_grid = true;

    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(&view, &mut container, &request, &ports)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Build));
    assert_eq!(grid.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_cross_origin_layer_is_fatal_and_distinct_from_blank() {
    // Plain cross-origin request: loads fine, taints its canvas
    let (endpoint, _hits) = spawn_wms(|_| StubResponse {
        status: 200,
        content_type: "image/png",
        body: png_solid([120, 120, 120, 255]),
        allow_origin: false,
    });
    let source = WmsSource {
        endpoint,
        layers: "aerial".into(),
        srs: None,
        opacity: 1.0,
        visible: true,
        cross_origin: mapexport::CrossOriginMode::Plain,
    };
    let view = test_view(vec![SourceLayer::Wms(source)]);

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(&view, &mut container, &letter_landscape_request("tainted"), &providers(&doc))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Tainted(_)), "expected taint, got {:?}", err);
}

#[tokio::test]
async fn failed_layer_is_dropped_and_the_export_survives() {
    let (bad_endpoint, bad_hits) = spawn_wms(|_| StubResponse {
        status: 500,
        content_type: "text/plain",
        body: b"boom".to_vec(),
        allow_origin: true,
    });
    let (good_endpoint, _good_hits) = spawn_wms(|_| StubResponse::png(png_solid([5, 160, 90, 255])));
    let view = test_view(vec![wms_layer(&bad_endpoint), wms_layer(&good_endpoint)]);

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();
    exporter
        .export(&view, &mut container, &letter_landscape_request("partial"), &providers(&doc))
        .await
        .unwrap();

    // Bounded retry: three attempts for the lost layer, then it was dropped
    assert_eq!(bad_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn abort_policy_escalates_a_lost_layer() {
    let (bad_endpoint, _hits) = spawn_wms(|_| StubResponse {
        status: 404,
        content_type: "text/plain",
        body: b"missing".to_vec(),
        allow_origin: true,
    });
    let view = test_view(vec![wms_layer(&bad_endpoint)]);

    let mut config = test_config();
    config.layer_failure = mapexport::LayerFailurePolicy::Abort;

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(config).unwrap();
    let mut container = OffscreenContainer::default();
    let err = exporter
        .export(&view, &mut container, &letter_landscape_request("strict"), &providers(&doc))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LayerFetch(_)), "expected fetch error, got {:?}", err);
}

#[tokio::test]
async fn container_is_reused_across_sequential_exports() {
    let (endpoint, hits) = spawn_wms(|_| StubResponse::png(png_solid([90, 30, 30, 255])));
    let view = test_view(vec![wms_layer(&endpoint)]);

    let doc = CapturingDoc::default();
    let exporter = Exporter::new(test_config()).unwrap();
    let mut container = OffscreenContainer::default();

    for _ in 0..2 {
        exporter
            .export(&view, &mut container, &letter_landscape_request("again"), &providers(&doc))
            .await
            .unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!((container.width_px, container.height_px), (1500, 1125));
}
