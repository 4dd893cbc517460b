use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How many state transitions each origin's history ring retains.
const TRANSITION_RING_CAPACITY: usize = 50;

/// Per-origin circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: u32,
	#[serde(with = "humantime_serde")]
	pub reset_timeout: Duration,
	pub half_open_max_probes: u32,
	/// Upstream status codes that count as a success regardless of class —
	/// e.g. an origin that legitimately answers some requests with a 404
	/// (end of a VOD asset, a missing optional track) shouldn't trip the
	/// breaker for it.
	pub acceptable_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			reset_timeout: Duration::from_secs(30),
			half_open_max_probes: 1,
			acceptable_status_codes: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Closed,
	Open,
	HalfOpen,
}

/// What kind of outcome a failed attempt represents, so origins can be
/// inspected for whether they're failing on connect (`Network`), on stalled
/// reads (`Timeout`), or on the upstream actively answering with an error
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
	Status2xx,
	Status4xx,
	Status5xx,
	Timeout,
	Network,
}

/// One recorded state change, kept for operational visibility into why an
/// origin's breaker is in the state it's in.
#[derive(Debug, Clone)]
pub struct Transition {
	pub at: Instant,
	pub from: &'static str,
	pub to: &'static str,
	pub reason: &'static str,
	/// Consecutive failures (entering `Open`) or consecutive successful
	/// probes (entering `Closed` from `HalfOpen`) that triggered this
	/// transition.
	pub consecutive_count: u32,
}

fn state_label(state: State) -> &'static str {
	match state {
		State::Closed => "closed",
		State::Open => "open",
		State::HalfOpen => "half_open",
	}
}

struct OriginState {
	state: State,
	consecutive_failures: u32,
	half_open_successes: u32,
	opened_at: Option<Instant>,
	half_open_probes_in_flight: u32,
	failures_by_kind: HashMap<FailureKind, u64>,
	transitions: VecDeque<Transition>,
}

impl OriginState {
	fn new() -> Self {
		Self {
			state: State::Closed,
			consecutive_failures: 0,
			half_open_successes: 0,
			opened_at: None,
			half_open_probes_in_flight: 0,
			failures_by_kind: HashMap::new(),
			transitions: VecDeque::new(),
		}
	}

	fn transition_to(&mut self, to: State, reason: &'static str, consecutive_count: u32) {
		let from = self.state;
		self.state = to;
		if from == to {
			return;
		}
		self.transitions.push_back(Transition {
			at: Instant::now(),
			from: state_label(from),
			to: state_label(to),
			reason,
			consecutive_count,
		});
		while self.transitions.len() > TRANSITION_RING_CAPACITY {
			self.transitions.pop_front();
		}
	}
}

/// Per-origin failure tracker deciding whether new connection attempts to an
/// upstream host are allowed through.
///
/// Closed → Open after `failure_threshold` consecutive failures. Open →
/// HalfOpen after `reset_timeout` elapses, admitting up to
/// `half_open_max_probes` concurrent trial requests. HalfOpen → Closed once
/// `half_open_max_probes` probes succeed consecutively; HalfOpen → Open on
/// any probe failure.
pub struct CircuitBreaker {
	config: CircuitBreakerConfig,
	origins: Mutex<HashMap<String, OriginState>>,
}

impl CircuitBreaker {
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self {
			config,
			origins: Mutex::new(HashMap::new()),
		}
	}

	/// Returns `true` if a new attempt to `origin` should be allowed.
	/// HalfOpen probes are counted here, not just checked — this call is the
	/// admission gate, matching the connection pool's `acquire` contract.
	pub fn allow(&self, origin: &str) -> bool {
		let mut origins = self.origins.lock().unwrap();
		let entry = origins.entry(origin.to_string()).or_insert_with(OriginState::new);

		match entry.state {
			State::Closed => true,
			State::Open => {
				let opened_at = entry.opened_at.expect("opened_at set when entering Open");
				if opened_at.elapsed() >= self.config.reset_timeout {
					entry.transition_to(State::HalfOpen, "reset_timeout elapsed", 0);
					entry.half_open_probes_in_flight = 1;
					entry.half_open_successes = 0;
					true
				} else {
					false
				}
			}
			State::HalfOpen => {
				if entry.half_open_probes_in_flight < self.config.half_open_max_probes {
					entry.half_open_probes_in_flight += 1;
					true
				} else {
					false
				}
			}
		}
	}

	/// Records a successful attempt against `origin`. Outside `HalfOpen` this
	/// just resets the failure streak; inside `HalfOpen` the origin is only
	/// promoted back to `Closed` once `half_open_max_probes` consecutive
	/// probes have succeeded, not on the first one.
	pub fn record_success(&self, origin: &str) {
		let mut origins = self.origins.lock().unwrap();
		if let Some(entry) = origins.get_mut(origin) {
			match entry.state {
				State::HalfOpen => {
					entry.half_open_successes += 1;
					entry.half_open_probes_in_flight = entry.half_open_probes_in_flight.saturating_sub(1);
					if entry.half_open_successes >= self.config.half_open_max_probes {
						entry.transition_to(State::Closed, "half_open_max_probes consecutive successes", entry.half_open_successes);
						entry.consecutive_failures = 0;
						entry.opened_at = None;
						entry.half_open_probes_in_flight = 0;
						entry.half_open_successes = 0;
					}
				}
				State::Closed | State::Open => {
					entry.consecutive_failures = 0;
				}
			}
		}
	}

	/// Records a failed attempt against `origin`, categorized by `kind` for
	/// operational introspection. A single failure while `HalfOpen` reopens
	/// the circuit immediately, resetting the consecutive-success counter.
	pub fn record_failure(&self, origin: &str, kind: FailureKind) {
		let mut origins = self.origins.lock().unwrap();
		let entry = origins.entry(origin.to_string()).or_insert_with(OriginState::new);
		*entry.failures_by_kind.entry(kind).or_insert(0) += 1;

		match entry.state {
			State::HalfOpen => {
				entry.transition_to(State::Open, "probe failed in half_open", entry.consecutive_failures + 1);
				entry.opened_at = Some(Instant::now());
				entry.half_open_probes_in_flight = 0;
				entry.half_open_successes = 0;
			}
			State::Closed | State::Open => {
				entry.consecutive_failures += 1;
				if entry.consecutive_failures >= self.config.failure_threshold {
					entry.transition_to(State::Open, "failure_threshold reached", entry.consecutive_failures);
					entry.opened_at = Some(Instant::now());
				}
			}
		}
	}

	/// Convenience wrapper around [`Self::record_success`]/
	/// [`Self::record_failure`] for callers that observe a raw HTTP status
	/// code: codes listed in `acceptable_status_codes` count as success
	/// regardless of class, otherwise 2xx is success and everything else is
	/// a failure categorized by status class.
	pub fn observe_status(&self, origin: &str, status: u16) {
		if self.config.acceptable_status_codes.contains(&status) {
			self.record_success(origin);
			return;
		}
		match status {
			200..=299 => self.record_success(origin),
			400..=499 => self.record_failure(origin, FailureKind::Status4xx),
			500..=599 => self.record_failure(origin, FailureKind::Status5xx),
			_ => self.record_failure(origin, FailureKind::Network),
		}
	}

	pub fn is_open(&self, origin: &str) -> bool {
		matches!(
			self.origins.lock().unwrap().get(origin).map(|e| e.state),
			Some(State::Open)
		)
	}

	/// Returns a snapshot of `origin`'s recorded transitions, oldest first,
	/// for diagnostics/metrics endpoints. Empty if the origin has never been
	/// observed.
	pub fn transitions(&self, origin: &str) -> Vec<Transition> {
		self.origins
			.lock()
			.unwrap()
			.get(origin)
			.map(|e| e.transitions.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Returns `origin`'s failure counts by [`FailureKind`], for diagnostics.
	pub fn failure_counts(&self, origin: &str) -> HashMap<FailureKind, u64> {
		self.origins
			.lock()
			.unwrap()
			.get(origin)
			.map(|e| e.failures_by_kind.clone())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn opens_after_threshold_failures() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 3,
			..Default::default()
		});
		assert!(cb.allow("origin-a"));
		cb.record_failure("origin-a", FailureKind::Network);
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.allow("origin-a"));
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(!cb.allow("origin-a"));
		assert!(cb.is_open("origin-a"));
	}

	#[test]
	fn half_open_success_closes() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			reset_timeout: Duration::from_millis(0),
			half_open_max_probes: 1,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.is_open("origin-a"));
		assert!(cb.allow("origin-a"));
		cb.record_success("origin-a");
		assert!(!cb.is_open("origin-a"));
		assert!(cb.allow("origin-a"));
	}

	#[test]
	fn half_open_requires_consecutive_successes() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			reset_timeout: Duration::from_millis(0),
			half_open_max_probes: 3,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.allow("origin-a"));

		cb.record_success("origin-a");
		assert!(cb.is_open("origin-a"), "one probe success shouldn't close a breaker needing 3");
		assert!(cb.allow("origin-a"));

		cb.record_success("origin-a");
		assert!(cb.is_open("origin-a"), "two probe successes shouldn't close a breaker needing 3");
		assert!(cb.allow("origin-a"));

		cb.record_success("origin-a");
		assert!(!cb.is_open("origin-a"), "third consecutive probe success should close it");
	}

	#[test]
	fn half_open_failure_mid_sequence_reopens_and_resets_streak() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			reset_timeout: Duration::from_millis(0),
			half_open_max_probes: 3,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.allow("origin-a"));
		cb.record_success("origin-a");
		cb.record_failure("origin-a", FailureKind::Timeout);
		assert!(cb.is_open("origin-a"));

		assert!(cb.allow("origin-a"));
		cb.record_success("origin-a");
		assert!(cb.is_open("origin-a"), "streak reset by the earlier failure, one success isn't enough");
	}

	#[test]
	fn half_open_failure_reopens() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			reset_timeout: Duration::from_millis(0),
			half_open_max_probes: 1,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.allow("origin-a"));
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.is_open("origin-a"));
	}

	#[test]
	fn independent_origins() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.is_open("origin-a"));
		assert!(cb.allow("origin-b"));
	}

	#[test]
	fn acceptable_status_codes_count_as_success() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			acceptable_status_codes: vec![404],
			..Default::default()
		});
		cb.observe_status("origin-a", 404);
		assert!(!cb.is_open("origin-a"));
		assert!(cb.failure_counts("origin-a").is_empty());
	}

	#[test]
	fn observe_status_categorizes_failures_by_class() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 10,
			..Default::default()
		});
		cb.observe_status("origin-a", 500);
		cb.observe_status("origin-a", 404);
		let counts = cb.failure_counts("origin-a");
		assert_eq!(counts.get(&FailureKind::Status5xx), Some(&1));
		assert_eq!(counts.get(&FailureKind::Status4xx), Some(&1));
	}

	#[test]
	fn transitions_are_recorded_and_bounded() {
		let cb = CircuitBreaker::new(CircuitBreakerConfig {
			failure_threshold: 1,
			reset_timeout: Duration::from_millis(0),
			half_open_max_probes: 1,
			..Default::default()
		});
		cb.record_failure("origin-a", FailureKind::Network);
		assert!(cb.allow("origin-a"));
		cb.record_success("origin-a");
		let transitions = cb.transitions("origin-a");
		assert_eq!(transitions.len(), 3);
		assert_eq!(transitions[0].to, "open");
		assert_eq!(transitions[1].to, "half_open");
		assert_eq!(transitions[2].to, "closed");
	}
}
