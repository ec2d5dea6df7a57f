use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use interview_rtc::{
    cors_layer, create_router, encoder_factory, AppState, ArtifactSink, CallDeps, CallSession,
    Config, FileArtifactSink, MediaSource, MemoryRelay, NatsRelay, SyntheticSource, TrackKind,
    WebRtcBindingFactory,
};
use interview_rtc::media::{codec_factory, FrameFormat};
use interview_rtc::signaling::RelayConnector;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "interview-rtc", version, about = "Interview call core")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/interview-rtc")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the call core behind the local control API
    Serve {
        /// Signaling relay to use
        #[arg(long, value_enum, default_value_t = RelayKind::Nats)]
        relay: RelayKind,

        /// Connect to the relay with this identity token at startup
        #[arg(long)]
        identity: Option<String>,
    },
    /// List the capture devices of the media source
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum RelayKind {
    Nats,
    /// In-process relay, for local demos
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    info!("Interview RTC v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    match cli.command {
        Command::Serve { relay, identity } => serve(cfg, relay, identity).await,
        Command::Devices => {
            let source = SyntheticSource::new(cfg.devices.clone());
            for kind in [TrackKind::Audio, TrackKind::Video] {
                for device in source.devices(kind) {
                    println!(
                        "{:<6} {:<22} {}{}",
                        kind,
                        device.id,
                        device.label,
                        if device.is_default { " (default)" } else { "" }
                    );
                }
            }
            Ok(())
        }
    }
}

async fn serve(cfg: Config, relay: RelayKind, identity: Option<String>) -> Result<()> {
    let connector: Arc<dyn RelayConnector> = match relay {
        RelayKind::Nats => Arc::new(NatsRelay::new(&cfg.signaling)),
        RelayKind::Memory => Arc::new(MemoryRelay::new()),
    };
    let mut source = SyntheticSource::new(cfg.devices.clone());
    let mut bindings = WebRtcBindingFactory::new(cfg.webrtc.clone());
    if let Some(codecs) = codec_factory(&cfg.devices) {
        source = source.with_codecs(codecs.clone());
        bindings = bindings.with_codecs(codecs, FrameFormat::from(&cfg.devices));
    }
    let media: Arc<dyn MediaSource> = Arc::new(source);
    let sink: Arc<dyn ArtifactSink> =
        Arc::new(FileArtifactSink::new(&cfg.recording.output_dir));

    let call = Arc::new(CallSession::new(
        cfg.clone(),
        CallDeps {
            connector,
            bindings: Arc::new(bindings),
            media,
            encoder: encoder_factory(&cfg.recording),
            sink,
        },
    ));

    if let Some(identity) = identity {
        call.connect(&identity)
            .await
            .with_context(|| format!("Failed to connect to the relay as {}", identity))?;
    }

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP control API listening on {}", addr);

    let mut app = create_router(AppState::new(call.clone()));
    if let Some(cors) = cors_layer(&cfg.service.http.cors_origins) {
        app = app.layer(cors);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    call.disconnect().await;

    Ok(())
}
