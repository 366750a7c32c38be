use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;

use stt_server::asr::decoder::Decoder;
use stt_server::config::Config;
use stt_server::runtime::Runtime;
use stt_server::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();
    config.validate().context("invalid configuration")?;

    let (interim_decoder, final_decoder) = build_decoders(&config)?;
    let runtime = Runtime::start(config.clone(), interim_decoder, final_decoder)
        .context("starting runtime")?;

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    let app = server::router(runtime.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime.clone()))
        .await
        .context("serving")?;

    info!("shutdown complete");
    Ok(())
}

/// Load the model pair. With the `whisper` feature the configured models
/// must load or startup fails; otherwise the latency stub stands in.
fn build_decoders(config: &Config) -> anyhow::Result<(Box<dyn Decoder>, Box<dyn Decoder>)> {
    #[cfg(feature = "whisper")]
    {
        use stt_server::asr::whisper::WhisperDecoder;
        let interim = WhisperDecoder::load(&config.interim_model, false)
            .with_context(|| format!("loading interim model {}", config.interim_model))?;
        let final_ = WhisperDecoder::load(&config.final_model, true)
            .with_context(|| format!("loading final model {}", config.final_model))?;
        Ok((Box::new(interim), Box::new(final_)))
    }
    #[cfg(not(feature = "whisper"))]
    {
        use stt_server::asr::stub::StubDecoder;
        warn!(
            "built without the `whisper` feature; using the latency stub ({} ms/decode)",
            config.stub_decode_ms
        );
        Ok((
            Box::new(StubDecoder::new("stub-interim", config.stub_decode_ms)),
            Box::new(StubDecoder::new("stub-final", config.stub_decode_ms)),
        ))
    }
}

async fn shutdown_signal(runtime: Arc<Runtime>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {e}");
        return;
    }
    info!("shutdown signal received");
    runtime.shutdown();
}
