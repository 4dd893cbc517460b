//! HTTP relay server for live IPTV channels: demuxes one upstream origin per
//! channel into a shared elementary-stream buffer, then redirects, repackages
//! or transcodes it into whatever container each client's profile asks for.

mod channels;
mod config;
mod metrics;
mod processors;
mod transcode;
mod web;

pub use config::*;
pub use metrics::*;

use std::sync::Arc;
use std::time::Duration;

use relay_core::circuit_breaker::CircuitBreaker;
use relay_core::fallback::FallbackStream;
use relay_core::manager::SessionManager;
use relay_core::pool::ConnectionPool;

use crate::processors::ProcessorRegistry;
use crate::transcode::TranscodeRegistry;
use crate::web::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	rustls::crypto::aws_lc_rs::default_provider()
		.install_default()
		.expect("failed to install default crypto provider");

	let config = RelayConfig::load()?;
	config.log.init();

	let http_client = reqwest::Client::builder()
		.build()
		.expect("failed to build reqwest client");

	let state = Arc::new(AppState {
		channels: config.channels.clone(),
		sessions: SessionManager::new(config.core.buffer.variant_idle_timeout),
		pool: Arc::new(ConnectionPool::new(config.core.connection_pool.clone())),
		breaker: Arc::new(CircuitBreaker::new(config.core.circuit_breaker.clone())),
		processors: ProcessorRegistry::new(),
		transcodes: TranscodeRegistry::new(),
		metrics: MetricsTracker::new(),
		fallback: FallbackStream::new(),
		http_client,
		core: config.core.clone(),
	});

	tokio::spawn(sweep_idle_task(state.clone(), config.core.buffer.sweep_interval));

	let app = web::router(state);

	tracing::info!(bind = %config.server.bind, "listening");

	#[cfg(unix)]
	let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

	if config.server.tls_enabled() {
		let tls_config = relay_native::load_server_config(
			config.server.tls_cert.as_deref().expect("tls_cert checked by tls_enabled"),
			config.server.tls_key.as_deref().expect("tls_key checked by tls_enabled"),
		)?;
		axum_server::bind_rustls(config.server.bind, axum_server::tls_rustls::RustlsConfig::from_config(tls_config))
			.serve(app.into_make_service())
			.await?;
	} else {
		axum_server::bind(config.server.bind).serve(app.into_make_service()).await?;
	}

	Ok(())
}

/// Periodically evicts sessions idle past the configured timeout and tears
/// down any per-variant processors left registered for the channels they
/// backed, so HLS/DASH's shared-processor driver tasks don't keep polling a
/// buffer nobody is feeding anymore.
async fn sweep_idle_task(state: Arc<AppState>, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	loop {
		ticker.tick().await;
		let evicted = state.sessions.sweep_idle().await;
		for channel_id in evicted {
			state.processors.remove_channel(&channel_id).await;
		}
	}
}
