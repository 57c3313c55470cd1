use std::path::PathBuf;

use clap::Parser;

use mapexport::{ExportConfig, Exporter, MapView, OffscreenContainer};

/// Render a serialized map-view snapshot to a PNG file.
#[derive(Parser, Debug)]
#[command(name = "mapexport", version, about = "Off-screen map view rendering")]
struct Args {
    /// Path to a JSON map-view snapshot
    #[arg(long)]
    snapshot: PathBuf,

    /// Output PNG path
    #[arg(long, default_value = "map.png")]
    out: PathBuf,

    /// Viewport width in pixels
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Viewport height in pixels
    #[arg(long, default_value_t = 768)]
    height: u32,

    /// Proxy base URL for remote layer requests
    #[arg(long)]
    proxy: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let text = std::fs::read_to_string(&args.snapshot)?;
    let view: MapView = serde_json::from_str(&text)?;

    let config = ExportConfig {
        proxy_url: args.proxy.clone(),
        ..Default::default()
    };
    let exporter = Exporter::new(config)?;
    let container = OffscreenContainer::new(args.width, args.height);

    let frame = exporter.render_view(&view, &container).await?;
    std::fs::write(&args.out, frame.encode_png()?)?;
    println!("wrote {}x{} composite to {}", args.width, args.height, args.out.display());
    Ok(())
}
