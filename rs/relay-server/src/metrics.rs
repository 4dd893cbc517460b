// Metrics tracking for the tvarr relay
// Plain atomic counters exposed as a text snapshot by GET /metrics, rather
// than a full OTLP/Prometheus exporter pipeline.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Global metrics tracker.
///
/// Every relay-core component that owns a count worth surfacing reports into
/// this struct rather than each owning its own ad hoc counter, matching the
/// teacher's single shared `MetricsTracker` passed by reference into request
/// handling.
#[derive(Clone, Default)]
pub struct MetricsTracker {
	active_sessions: Arc<AtomicI64>,
	total_sessions: Arc<AtomicU64>,
	active_processors: Arc<AtomicI64>,
	active_transcoders: Arc<AtomicI64>,
	transcoder_restarts: Arc<AtomicU64>,
	circuit_breaker_trips: Arc<AtomicU64>,
	requests_total: Arc<AtomicU64>,
	requests_fallback: Arc<AtomicU64>,
	bytes_relayed: Arc<AtomicU64>,
	segments_served: Arc<AtomicU64>,
}

impl MetricsTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn session_opened(&self) {
		self.active_sessions.fetch_add(1, Ordering::Relaxed);
		self.total_sessions.fetch_add(1, Ordering::Relaxed);
	}

	pub fn session_closed(&self) {
		self.active_sessions.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn processor_attached(&self) {
		self.active_processors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn processor_detached(&self) {
		self.active_processors.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn transcoder_started(&self) {
		self.active_transcoders.fetch_add(1, Ordering::Relaxed);
	}

	pub fn transcoder_stopped(&self) {
		self.active_transcoders.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn record_transcoder_restart(&self) {
		self.transcoder_restarts.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_circuit_trip(&self) {
		self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_request(&self) {
		self.requests_total.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_fallback_served(&self) {
		self.requests_fallback.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_bytes_relayed(&self, bytes: u64) {
		self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn record_segment_served(&self) {
		self.segments_served.fetch_add(1, Ordering::Relaxed);
	}

	pub fn active_sessions(&self) -> i64 {
		self.active_sessions.load(Ordering::Relaxed)
	}

	pub fn total_sessions(&self) -> u64 {
		self.total_sessions.load(Ordering::Relaxed)
	}

	pub fn active_processors(&self) -> i64 {
		self.active_processors.load(Ordering::Relaxed)
	}

	pub fn active_transcoders(&self) -> i64 {
		self.active_transcoders.load(Ordering::Relaxed)
	}

	/// Renders the current counters as `name value` lines, one per metric.
	/// Deliberately not Prometheus exposition format: there is no exporter
	/// dependency in this binary, just a plain-text snapshot an operator or
	/// a scrape-and-relabel sidecar can consume.
	pub fn render(&self) -> String {
		format!(
			"relay_active_sessions {}\n\
			 relay_total_sessions {}\n\
			 relay_active_processors {}\n\
			 relay_active_transcoders {}\n\
			 relay_transcoder_restarts_total {}\n\
			 relay_circuit_breaker_trips_total {}\n\
			 relay_requests_total {}\n\
			 relay_requests_fallback_total {}\n\
			 relay_bytes_relayed_total {}\n\
			 relay_segments_served_total {}\n",
			self.active_sessions(),
			self.total_sessions(),
			self.active_processors.load(Ordering::Relaxed),
			self.active_transcoders(),
			self.transcoder_restarts.load(Ordering::Relaxed),
			self.circuit_breaker_trips.load(Ordering::Relaxed),
			self.requests_total.load(Ordering::Relaxed),
			self.requests_fallback.load(Ordering::Relaxed),
			self.bytes_relayed.load(Ordering::Relaxed),
			self.segments_served.load(Ordering::Relaxed),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_counters_track_open_and_close() {
		let metrics = MetricsTracker::new();
		metrics.session_opened();
		metrics.session_opened();
		metrics.session_closed();
		assert_eq!(metrics.active_sessions(), 1);
		assert_eq!(metrics.total_sessions(), 2);
	}

	#[test]
	fn render_includes_all_counters() {
		let metrics = MetricsTracker::new();
		metrics.record_request();
		let rendered = metrics.render();
		assert!(rendered.contains("relay_requests_total 1"));
		assert!(rendered.contains("relay_active_sessions 0"));
	}
}
