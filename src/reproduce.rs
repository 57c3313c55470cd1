//! Converts live-map layers into export-ready representations.
//!
//! Remote raster services are re-requested as one static image covering the
//! export extent; vector layers are deep-cloned. Any other layer kind is
//! dropped from the export. One failing remote layer costs that layer, not
//! the export, unless the caller opts into escalation.

use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use reqwest::Client;
use tiny_skia::Pixmap;
use url::Url;

use crate::error::{Error, Result};
use crate::geometry::WorldExtent;
use crate::view::{CrossOriginMode, Feature, SourceLayer, VectorSource, WmsSource};

/// Retry policy for per-layer image fetches.
///
/// Deliberately separate from the top-level render retry: a failed fetch
/// costs one layer and retries with a fixed delay, a failed render costs the
/// whole export and retries immediately. The two must stay independently
/// tunable.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Proxy base URL; the target URL is percent-encoded and appended.
    pub proxy_url: Option<String>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(400),
            proxy_url: None,
        }
    }
}

/// What to do when a single remote layer keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerFailurePolicy {
    /// Omit the layer and keep exporting. Favors availability.
    #[default]
    DropLayer,
    /// Abort the render stage on the first lost layer. Favors completeness.
    Abort,
}

/// A decoded remote image pinned to a world extent.
#[derive(Clone)]
pub struct StaticImage {
    pub pixmap: Pixmap,
    pub extent: WorldExtent,
    pub opacity: f32,
    pub visible: bool,
    /// Whether the surface this image is drawn onto stays pixel-readable.
    pub origin_clean: bool,
    pub name: String,
}

/// Deep-cloned vector layer.
#[derive(Clone)]
pub struct VectorOverlay {
    pub features: Vec<Feature>,
    pub opacity: f32,
    pub visible: bool,
    pub name: String,
}

/// Export-ready form of one live layer.
#[derive(Clone)]
pub enum ExportLayer {
    Raster(StaticImage),
    Vector(VectorOverlay),
}

impl ExportLayer {
    pub fn visible(&self) -> bool {
        match self {
            ExportLayer::Raster(image) => image.visible,
            ExportLayer::Vector(overlay) => overlay.visible,
        }
    }

    pub fn opacity(&self) -> f32 {
        match self {
            ExportLayer::Raster(image) => image.opacity,
            ExportLayer::Vector(overlay) => overlay.opacity,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ExportLayer::Raster(image) => &image.name,
            ExportLayer::Vector(overlay) => &overlay.name,
        }
    }
}

/// Build the GetMap request URL for one layer against the export extent.
pub fn getmap_url(
    source: &WmsSource,
    srs_fallback: &str,
    bbox: &WorldExtent,
    width_px: u32,
    height_px: u32,
    proxy: Option<&str>,
) -> Result<String> {
    let mut url = Url::parse(&source.endpoint)
        .map_err(|e| Error::LayerFetch(format!("bad endpoint {}: {}", source.endpoint, e)))?;
    let srs = source.srs.as_deref().unwrap_or(srs_fallback);
    url.query_pairs_mut()
        .append_pair("SERVICE", "WMS")
        .append_pair("VERSION", "1.1.1")
        .append_pair("REQUEST", "GetMap")
        .append_pair("LAYERS", &source.layers)
        .append_pair("STYLES", "")
        .append_pair("FORMAT", "image/png")
        .append_pair("TRANSPARENT", "TRUE")
        .append_pair("SRS", srs)
        .append_pair("BBOX", &bbox.bbox_param())
        .append_pair("WIDTH", &width_px.to_string())
        .append_pair("HEIGHT", &height_px.to_string());
    let target = url.to_string();
    Ok(match proxy {
        Some(prefix) => format!("{}{}", prefix, urlencoding::encode(&target)),
        None => target,
    })
}

async fn try_fetch(client: &Client, url: &str) -> Result<(Vec<u8>, bool)> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Network(format!("GET {} failed: {}", url, e)))?;
    if !resp.status().is_success() {
        return Err(Error::LayerFetch(format!("{} returned {}", url, resp.status())));
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.starts_with("image/") {
        return Err(Error::LayerFetch(format!(
            "{} returned non-image content type {:?}",
            url, content_type
        )));
    }
    let grants_read = resp
        .headers()
        .get(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_some();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::Network(format!("reading {} body: {}", url, e)))?;
    Ok((bytes.to_vec(), grants_read))
}

/// GET with bounded retry and a fixed delay between attempts. A non-2xx
/// status or a non-image content type is a hard failure for this layer.
/// Returns the body and whether the response grants cross-origin reads.
async fn fetch_image_bytes(client: &Client, url: &str, policy: &FetchPolicy) -> Result<(Vec<u8>, bool)> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.retry_delay).await;
        }
        match try_fetch(client, url).await {
            Ok(ok) => return Ok(ok),
            Err(e) => {
                debug!("GetMap attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Network(format!("GET {} failed", url))))
}

/// Browser canvas semantics: an anonymous request must be granted read
/// access or the load fails; a plain cross-origin load succeeds but taints
/// the surface. Proxied requests are same-origin and always clean.
fn origin_clean(mode: CrossOriginMode, proxied: bool, grants_read: bool) -> Result<bool> {
    if proxied {
        return Ok(true);
    }
    match mode {
        CrossOriginMode::Anonymous if grants_read => Ok(true),
        CrossOriginMode::Anonymous => Err(Error::LayerFetch(
            "cross-origin request was not granted read access".into(),
        )),
        CrossOriginMode::Plain => Ok(false),
    }
}

/// Decode fetched bytes into a premultiplied pixmap.
///
/// Decoding happens here, before the image is handed to the surface, so the
/// draw pass never races a bitmap that is not actually ready yet.
pub fn decode_image(bytes: &[u8]) -> Result<Pixmap> {
    let decoded = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)
        .ok_or_else(|| Error::Decode(format!("invalid image size {}x{}", width, height)))?;
    for (src, dst) in rgba
        .as_raw()
        .chunks_exact(4)
        .zip(pixmap.data_mut().chunks_exact_mut(4))
    {
        let a = src[3];
        dst[0] = premul_u8(src[0], a);
        dst[1] = premul_u8(src[1], a);
        dst[2] = premul_u8(src[2], a);
        dst[3] = a;
    }
    Ok(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = u16::from(channel) * u16::from(alpha) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

/// Re-request one remote layer as a single static image over `extent`.
pub async fn reproduce_wms(
    client: &Client,
    source: &WmsSource,
    srs_fallback: &str,
    extent: &WorldExtent,
    width_px: u32,
    height_px: u32,
    policy: &FetchPolicy,
    name: &str,
) -> Result<StaticImage> {
    let proxied = policy.proxy_url.is_some();
    let url = getmap_url(
        source,
        srs_fallback,
        extent,
        width_px,
        height_px,
        policy.proxy_url.as_deref(),
    )?;
    let (bytes, grants_read) = fetch_image_bytes(client, &url, policy).await?;
    let clean = origin_clean(source.cross_origin, proxied, grants_read)?;
    let pixmap = decode_image(&bytes)?;
    Ok(StaticImage {
        pixmap,
        extent: *extent,
        opacity: source.opacity,
        visible: source.visible,
        origin_clean: clean,
        name: name.to_string(),
    })
}

/// Deep-clone a vector layer for export.
pub fn reproduce_vector(source: &VectorSource, name: &str) -> VectorOverlay {
    VectorOverlay {
        features: source.features.clone(),
        opacity: source.opacity,
        visible: source.visible,
        name: name.to_string(),
    }
}

/// Reproduce every visible live layer for one export.
///
/// Remote layers are fetched concurrently and resolve in any order; the
/// result preserves the input layer order. A lost layer is logged and
/// omitted under [`LayerFailurePolicy::DropLayer`], or aborts the batch
/// under [`LayerFailurePolicy::Abort`].
#[allow(clippy::too_many_arguments)]
pub async fn reproduce_layers(
    client: &Client,
    layers: &[SourceLayer],
    srs: &str,
    extent: &WorldExtent,
    width_px: u32,
    height_px: u32,
    policy: &FetchPolicy,
    failure_policy: LayerFailurePolicy,
) -> Result<Vec<ExportLayer>> {
    let pending: Vec<_> = layers
        .iter()
        .enumerate()
        .map(|(idx, layer)| async move {
            match layer {
                SourceLayer::Wms(source) => {
                    if !source.visible {
                        return Ok(None);
                    }
                    let name = format!("wms-{}", idx);
                    match reproduce_wms(client, source, srs, extent, width_px, height_px, policy, &name)
                        .await
                    {
                        Ok(image) => Ok(Some(ExportLayer::Raster(image))),
                        Err(e) => Err((name, e)),
                    }
                }
                SourceLayer::Vector(source) => {
                    if !source.visible {
                        return Ok(None);
                    }
                    Ok(Some(ExportLayer::Vector(reproduce_vector(
                        source,
                        &format!("vector-{}", idx),
                    ))))
                }
                SourceLayer::Unsupported { kind } => {
                    debug!("dropping unsupported layer kind {:?}", kind);
                    Ok(None)
                }
            }
        })
        .collect();

    let mut out = Vec::new();
    for resolved in join_all(pending).await {
        match resolved {
            Ok(Some(layer)) => out.push(layer),
            Ok(None) => {}
            Err((name, e)) => match failure_policy {
                LayerFailurePolicy::DropLayer => warn!("layer {} dropped from export: {}", name, e),
                LayerFailurePolicy::Abort => return Err(e),
            },
        }
    }
    Ok(out)
}
