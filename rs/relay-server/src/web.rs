//! HTTP surface: `GET /relay/stream/{channel_id}` decides direct/repackage/
//! transcode delivery per request and serves whichever container the
//! resolved profile calls for, plus the ambient `/healthz`/`/metrics`
//! endpoints every binary in this workspace exposes.
//!
//! Grounded on `hang-cli::web::run_web` for the overall shape (permissive
//! CORS, `axum_server::bind`) and on `moq-relay::web::ServeGroup` for the
//! streaming-body pattern used by the continuous MPEG-TS response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as PollContext, Poll};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use relay_core::circuit_breaker::CircuitBreaker;
use relay_core::classification::Classification;
use relay_core::config::RelayCoreConfig;
use relay_core::delivery::{Decision, DeliveryRouter};
use relay_core::fallback::FallbackStream;
use relay_core::ingest;
use relay_core::manager::SessionManager;
use relay_core::model::buffer::VariantRefGuard;
use relay_core::model::{ESVariantConsumer, VariantKey};
use relay_core::output::mpegts::MpegTsProcessor;
use relay_core::output::Processor as _;
use relay_core::pool::ConnectionPool;
use relay_core::profile::{ContainerHint, RelayProfile};
use relay_core::session::{Session, SessionRefGuard};
use relay_core::transcoder::args::output_is_fmp4;
use relay_core::{RelayError, Result as RelayResult};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::channels::ChannelDirectory;
use crate::metrics::MetricsTracker;
use crate::processors::ProcessorRegistry;
use crate::transcode::TranscodeRegistry;

/// Everything a request handler needs, shared across every connection the
/// same way `moq-relay::WebState` bundles its cluster/auth handles.
pub struct AppState {
	pub channels: ChannelDirectory,
	pub sessions: SessionManager,
	pub pool: Arc<ConnectionPool>,
	pub breaker: Arc<CircuitBreaker>,
	pub processors: ProcessorRegistry,
	pub transcodes: TranscodeRegistry,
	pub metrics: MetricsTracker,
	pub fallback: FallbackStream,
	pub http_client: reqwest::Client,
	pub core: RelayCoreConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/relay/stream/{channel_id}", get(stream_handler))
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics_handler))
		.layer(CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]))
		.with_state(state)
}

async fn healthz() -> impl IntoResponse {
	(StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	state.metrics.render()
}

#[derive(Debug, Deserialize)]
struct StreamParams {
	format: Option<String>,
	seg: Option<u64>,
	init: Option<String>,
	profile: Option<String>,
}

async fn stream_handler(
	State(state): State<Arc<AppState>>,
	Path(channel_id): Path<String>,
	Query(params): Query<StreamParams>,
	headers: HeaderMap,
) -> Response {
	state.metrics.record_request();
	match handle_stream(&state, &channel_id, &params, &headers).await {
		Ok(response) => response,
		Err(err) => error_response(&state, err),
	}
}

fn error_response(state: &AppState, err: RelayError) -> Response {
	if matches!(err, RelayError::Origin(_) | RelayError::CircuitOpen) {
		state.metrics.record_fallback_served();
		let mut response = (
			StatusCode::OK,
			[(header::CONTENT_TYPE, HeaderValue::from_static("video/MP2T"))],
			state.fallback.loop_bytes(),
		)
			.into_response();
		response
			.headers_mut()
			.insert("x-stream-decision", HeaderValue::from_static("fallback"));
		return response;
	}
	let status = StatusCode::from_u16(err.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(status, err.to_string()).into_response()
}

/// Which of the four container families a request resolved to, before the
/// HLS-vs-HLS-fMP4 split (that split depends on the profile, not the
/// request, and is folded in by [`container_hint`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFormat {
	MpegTs,
	Hls,
	Dash,
}

fn parse_format(raw: Option<&str>, headers: &HeaderMap) -> RelayResult<RequestFormat> {
	match raw {
		Some("mpegts") => Ok(RequestFormat::MpegTs),
		Some("hls") => Ok(RequestFormat::Hls),
		Some("dash") => Ok(RequestFormat::Dash),
		Some("auto") | None => Ok(sniff_format(headers)),
		Some(other) => Err(RelayError::BadRequest(format!("unknown format '{other}'"))),
	}
}

/// `auto` format resolution per the client's `Accept`/`User-Agent`: an Apple
/// media client gets HLS, a DASH-aware `Accept` gets DASH, everything else
/// gets plain MPEG-TS.
fn sniff_format(headers: &HeaderMap) -> RequestFormat {
	let accept = headers
		.get(header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	if accept.contains("dash+xml") {
		return RequestFormat::Dash;
	}
	let user_agent = headers
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	if user_agent.contains("AppleCoreMedia") || user_agent.contains("Apple") {
		return RequestFormat::Hls;
	}
	RequestFormat::MpegTs
}

/// Folds the profile's target codecs into the request's container choice:
/// `hls` is HLS-fMP4 when the profile's targets need CMAF anyway (same test
/// the transcoder's stdout format uses), HLS-TS otherwise.
fn container_hint(format: RequestFormat, profile: &RelayProfile) -> ContainerHint {
	match format {
		RequestFormat::MpegTs => ContainerHint::MpegTs,
		RequestFormat::Dash => ContainerHint::Dash,
		RequestFormat::Hls => {
			if output_is_fmp4(profile) {
				ContainerHint::HlsFmp4
			} else {
				ContainerHint::HlsTs
			}
		}
	}
}

fn decision_header(classification: &Classification, profile: &RelayProfile, decision: Decision) -> &'static str {
	match decision {
		Decision::Direct => "direct",
		Decision::Transcode => "transcode",
		Decision::Repackage => {
			if DeliveryRouter::container_matches(classification, profile) {
				"passthrough"
			} else {
				"repackage"
			}
		}
	}
}

async fn handle_stream(
	state: &Arc<AppState>,
	channel_id: &str,
	params: &StreamParams,
	headers: &HeaderMap,
) -> RelayResult<Response> {
	let entry = state.channels.get(channel_id).ok_or(RelayError::NotFound)?;
	let profile = entry
		.profile(params.profile.as_deref())
		.ok_or_else(|| RelayError::BadRequest(format!("unknown profile for channel '{channel_id}'")))?
		.clone();
	let format = parse_format(params.format.as_deref(), headers)?;

	let origin = entry.origin.clone();
	let host = origin.host_str().unwrap_or_default().to_string();
	if state.sessions.get(channel_id).await.is_none() && !state.breaker.allow(&host) {
		return Err(RelayError::CircuitOpen);
	}

	let client = state.http_client.clone();
	let session = state
		.sessions
		.get_or_create(channel_id, || {
			let origin = origin.clone();
			let client = client.clone();
			let channel_id = channel_id.to_string();
			let metrics = state.metrics.clone();
			async move {
				let classification = ingest::probe_origin(&client, &origin).await?;
				metrics.session_opened();
				Ok(Session::new(channel_id, origin, classification))
			}
		})
		.await?;
	session.touch();

	let decision = DeliveryRouter::decide(&session.classification, &profile);

	if decision == Decision::Direct {
		let mut response = Redirect::to(session.origin_url.as_str()).into_response();
		response
			.headers_mut()
			.insert("x-stream-decision", HeaderValue::from_static("direct"));
		return Ok(response);
	}

	let decision_label = decision_header(&session.classification, &profile, decision);
	let source_key = VariantKey::source(session.classification.video, session.classification.audio);
	let variant_key = DeliveryRouter::variant_key(&session.classification, &profile, decision);

	ensure_source_ingest(state, &session).await;

	let consumer = resolve_variant(state, &session, &source_key, &variant_key, &profile).await?;

	let container = container_hint(format, &profile);
	let session_guard = session.acquire();

	match container {
		ContainerHint::MpegTs => {
			if params.seg.is_some() || params.init.is_some() {
				return Err(RelayError::BadRequest("seg/init are not valid for mpegts".into()));
			}
			serve_mpegts(state, &session, session_guard, &variant_key, consumer, decision_label).await
		}
		ContainerHint::HlsTs | ContainerHint::HlsFmp4 | ContainerHint::Dash => {
			drop(session_guard);
			serve_segmented(
				state,
				&session,
				channel_id,
				container,
				&variant_key,
				consumer,
				params,
				decision_label,
			)
			.await
		}
	}
}

/// Resolves `variant_key`'s consumer from the session's buffer, building it
/// on demand (starting a transcoder pipeline) if it doesn't exist yet and
/// isn't the source variant. Direct and repackaged renditions just resolve
/// to an already-registered variant; transcoded ones are the case where
/// `on_variant_request` actually fires.
async fn resolve_variant(
	state: &Arc<AppState>,
	session: &Arc<Session>,
	source_key: &VariantKey,
	variant_key: &VariantKey,
	profile: &RelayProfile,
) -> RelayResult<ESVariantConsumer> {
	let transcodes = &state.transcodes;
	let core_config = state.core.transcoder.clone();
	let profile = profile.clone();
	session
		.buffer
		.get_or_create_variant(source_key, *variant_key, |source, target| async move {
			transcodes.ensure_running(session, source, target, profile, core_config).await
		})
		.await
}

/// Starts upstream ingest for `session` exactly once, lazily, the first
/// time a request actually needs a buffered source variant.
async fn ensure_source_ingest(state: &Arc<AppState>, session: &Arc<Session>) {
	let classification = session.classification.clone();
	let pool = state.pool.clone();
	let breaker = state.breaker.clone();
	let client = state.http_client.clone();
	let buffer = state.core.buffer.clone();
	let session_for_task = session.clone();
	session
		.ensure_source_ingest(|| async move {
			let source = ingest::build_source_variant(&classification, buffer.video_capacity, buffer.audio_capacity);
			session_for_task.buffer.insert_variant_consumer(source.key, source.consumer).await;
			tokio::spawn(async move {
				tokio::select! {
					result = ingest::run_ingest(classification, source.producer, pool, breaker, client) => {
						if let Err(err) = result {
							warn!(%err, channel = %session_for_task.channel_id, "upstream ingest ended");
						}
					}
					_ = session_for_task.closed() => {}
				}
			});
		})
		.await;
}

async fn serve_mpegts(
	state: &Arc<AppState>,
	session: &Arc<Session>,
	session_guard: SessionRefGuard,
	variant_key: &VariantKey,
	consumer: ESVariantConsumer,
	decision_label: &'static str,
) -> RelayResult<Response> {
	let variant_guard = session.buffer.register_processor(variant_key).await?;

	let mut processor = MpegTsProcessor::new(consumer);
	processor.attach().await?;
	state.metrics.processor_attached();

	let body = MpegTsBody {
		processor,
		metrics: state.metrics.clone(),
		_session_guard: session_guard,
		_variant_guard: variant_guard,
	};

	let mut response = Response::new(Body::new(body));
	response
		.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/MP2T"));
	response
		.headers_mut()
		.insert("x-stream-decision", HeaderValue::from_static(decision_label));
	Ok(response)
}

async fn serve_segmented(
	state: &Arc<AppState>,
	session: &Arc<Session>,
	channel_id: &str,
	container: ContainerHint,
	variant_key: &VariantKey,
	consumer: ESVariantConsumer,
	params: &StreamParams,
	decision_label: &'static str,
) -> RelayResult<Response> {
	let guard = session.buffer.register_processor(variant_key).await?;

	let shared = state
		.processors
		.get_or_start(channel_id, container, *variant_key, consumer, guard, state.core.segment.clone())
		.await;

	if let Some(sequence) = params.seg {
		let Some(data) = shared.segment_data(sequence).await else {
			return Err(RelayError::NotFound);
		};
		state.metrics.record_segment_served();
		state.metrics.record_bytes_relayed(data.len() as u64);
		let content_type = match container {
			ContainerHint::HlsTs => "video/MP2T",
			_ => "video/iso.segment",
		};
		let mut response = (
			StatusCode::OK,
			[(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
			data,
		)
			.into_response();
		response
			.headers_mut()
			.insert("x-stream-decision", HeaderValue::from_static(decision_label));
		return Ok(response);
	}

	if let Some(kind) = params.init.as_deref() {
		if !matches!(kind, "v" | "a") {
			return Err(RelayError::BadRequest(format!("unknown init target '{kind}'")));
		}
		if container == ContainerHint::HlsTs {
			return Err(RelayError::BadRequest("init segments don't exist for hls-ts".into()));
		}
		let snapshot = shared.snapshot().await;
		let Some(data) = snapshot.init_segment else {
			return Err(RelayError::NotFound);
		};
		let mut response = (
			StatusCode::OK,
			[
				(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4")),
				(header::CACHE_CONTROL, HeaderValue::from_static("max-age=86400")),
			],
			data,
		)
			.into_response();
		response
			.headers_mut()
			.insert("x-stream-decision", HeaderValue::from_static(decision_label));
		return Ok(response);
	}

	let snapshot = shared.snapshot().await;
	let (content_type, body) = match container {
		ContainerHint::Dash => ("application/dash+xml", snapshot.manifest.unwrap_or_default()),
		_ => ("application/vnd.apple.mpegurl", snapshot.playlist.unwrap_or_default()),
	};
	let mut response = (
		StatusCode::OK,
		[
			(header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
			(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store")),
		],
		body,
	)
		.into_response();
	response
		.headers_mut()
		.insert("x-stream-decision", HeaderValue::from_static(decision_label));
	Ok(response)
}

/// Continuous MPEG-TS response body: each `poll_frame` drives the processor
/// one sample further, holding the session and variant refcounts up for as
/// long as the client stays connected.
struct MpegTsBody {
	processor: MpegTsProcessor,
	metrics: MetricsTracker,
	_session_guard: SessionRefGuard,
	_variant_guard: VariantRefGuard,
}

impl http_body::Body for MpegTsBody {
	type Data = Bytes;
	type Error = BodyError;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut PollContext<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.get_mut();
		let future = this.processor.next_chunk();
		tokio::pin!(future);
		match ready!(future.poll(cx)) {
			Ok(Some(data)) => {
				this.metrics.record_bytes_relayed(data.len() as u64);
				Poll::Ready(Some(Ok(http_body::Frame::data(data))))
			}
			Ok(None) => Poll::Ready(None),
			Err(err) => Poll::Ready(Some(Err(BodyError(err)))),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct BodyError(#[from] RelayError);
