//! Headless viewer — entry point.
//!
//! ```text
//! vizlink-viewer                      Connect with defaults
//! vizlink-viewer --config <path>      Use custom config TOML
//! vizlink-viewer --four-view          Drive the four-view layout
//! vizlink-viewer --gen-config         Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vizlink_core::{Session, SessionRegistry, SessionState};

use vizlink_viewer::config::ViewerConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vizlink-viewer", about = "Remote visualization session driver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vizlink-viewer.toml")]
    config: PathBuf,

    /// Server endpoint (overrides config). Example: ws://host:8080/ws
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Application name (overrides config).
    #[arg(short, long)]
    application: Option<String>,

    /// Dataset reference (overrides config).
    #[arg(short, long)]
    dataset: Option<String>,

    /// Drive the standard four-view layout over one connection.
    #[arg(long)]
    four_view: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ViewerConfig::load(&cli.config);
    if let Some(endpoint) = cli.endpoint {
        config.session.endpoint = endpoint;
    }
    if let Some(application) = cli.application {
        config.session.application = application;
    }
    if let Some(dataset) = cli.dataset {
        config.session.dataset_ref = dataset;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vizlink-viewer v{}", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %config.session.endpoint, application = %config.session.application, "starting");

    if cli.four_view {
        run_four_view(&config).await
    } else {
        run_single(&config).await
    }
}

/// Drive one standalone session until Ctrl-C or connection loss.
async fn run_single(config: &ViewerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new(config.to_session_config());
    session.on_state_change(|state, error| match error {
        Some(message) => warn!(%state, "session: {message}"),
        None => info!(%state, "session"),
    });

    let mut frames = session.subscribe_frames();
    let mut states = session.state_receiver();

    // Recorded now, sent with the hello.
    session
        .resize(config.viewport.width, config.viewport.height)
        .await?;
    session.connect().await?;

    let mut rendered = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; disconnecting");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == SessionState::Ready && !rendered {
                    // Kick off the first image explicitly; later frames
                    // arrive as server pushes.
                    session.render().await?;
                    rendered = true;
                }
                if state == SessionState::Closed || state == SessionState::Failed {
                    break;
                }
            }
            raster = frames.next_raster() => {
                match raster {
                    Some(raster) => {
                        info!(width = raster.width, height = raster.height, "frame");
                    }
                    None => break,
                }
            }
        }
    }

    session.disconnect().await;
    let stats = session.stats();
    info!(
        accepted = stats.accepted,
        stale = stats.stale,
        malformed = stats.malformed,
        "session finished"
    );
    Ok(())
}

/// Drive the four-view layout until Ctrl-C.
async fn run_four_view(config: &ViewerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = SessionRegistry::new(&config.session.endpoint);
    let four = registry.register_four_view(config.to_session_config()).await?;

    // Quadrant size for a 2x2 layout.
    let (width, height) = (config.viewport.width / 2, config.viewport.height / 2);

    // One driver task per view: size it once Ready, then log frames.
    let labels = ["axial", "sagittal", "coronal", "volume"];
    for (label, session) in labels.iter().zip(four.all()) {
        let label = *label;
        let session = std::sync::Arc::clone(session);
        let mut frames = session.subscribe_frames();
        let mut states = session.state_receiver();
        tokio::spawn(async move {
            if *states.borrow_and_update() == SessionState::Ready {
                if let Err(e) = session.resize(width, height).await {
                    warn!(view = label, "resize failed: {e}");
                }
            }
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *states.borrow_and_update() == SessionState::Ready {
                            if let Err(e) = session.resize(width, height).await {
                                warn!(view = label, "resize failed: {e}");
                            }
                        }
                    }
                    raster = frames.next_raster() => {
                        match raster {
                            Some(raster) => {
                                info!(view = label, width = raster.width, height = raster.height, "frame");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupted; shutting down");

    registry.shutdown().await;
    info!(dropped = registry.dropped_frames(), "registry finished");
    Ok(())
}
