//! Broadcast server
//!
//! Captures the microphone, feeds the player bus, and serves listeners.
//! Usage: `mixcast-server [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mixcast::{
    audio::{AudioEngine, MixParameters, PcmFileFeeder, SourceKind},
    config::AppConfig,
    session::SessionRegistry,
    signaling::SignalingContext,
    transport::rtc::RtcPeerFactory,
    ui::WebServer,
};

/// How often the status line is logged
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting mixcast server");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    // Engine first: anything that fails from here on is fatal
    let params = Arc::new(MixParameters::default());
    let engine = AudioEngine::new(&config.audio, params);
    engine.start().context("starting audio engine")?;

    #[cfg(feature = "capture")]
    let _mic = {
        let feed = engine.take_source(SourceKind::Microphone)?;
        match mixcast::audio::MicCapture::start(
            config.audio.mic_device.as_deref(),
            config.audio.sample_rate,
            feed,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!(
                    "Cannot open microphone; available inputs: {:?}",
                    mixcast::audio::capture::input_device_names()
                );
                engine.stop();
                return Err(e).context("opening microphone");
            }
        }
    };

    let _player = match &config.audio.player_pcm {
        Some(path) => {
            let feed = engine.take_source(SourceKind::Player)?;
            let feeder = PcmFileFeeder::start(
                path,
                engine.frame_samples(),
                config.audio.frame_duration(),
                config.audio.player_loop,
                feed,
            )
            .context("opening player source")?;
            tracing::info!("Player bus fed from {}", path.display());
            Some(feeder)
        }
        None => None,
    };

    let route = engine.refresh_route();
    tracing::info!("Initial route: {}", route);

    let registry = Arc::new(SessionRegistry::new(engine.clone()));
    let factory = Arc::new(RtcPeerFactory::new(&config.audio, &config.rtc));
    let signaling = SignalingContext::new(
        registry.clone(),
        factory,
        Duration::from_millis(config.liveness.poll_interval_ms),
        config.server.accept_remote_mix,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down");
            }
            shutdown.cancel();
        });
    }

    // Periodic stats logging
    {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let engine = registry.engine();
                let mix = engine.params().snapshot();
                tracing::info!(
                    "Stats: {} listeners, {} sessions, alpha {:.2}, mic {}, route {}",
                    registry.listeners(),
                    registry.len(),
                    mix.alpha,
                    if mix.mic_muted { "muted" } else { "live" },
                    engine.resolve()
                );
            }
        });
    }

    let server = WebServer::new(config.server.clone(), signaling);
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    registry.clear();
    engine.stop();
    result.context("HTTP server")?;

    tracing::info!("Stopped");
    Ok(())
}
