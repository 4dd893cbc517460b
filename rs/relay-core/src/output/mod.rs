pub mod dash;
pub mod hls_fmp4;
pub mod hls_ts;
pub mod mpegts;
pub mod segment;

use std::sync::Mutex;

use crate::error::{RelayError, Result};

/// Lifecycle state shared by every output processor kind.
///
/// Transitions: `Idle` → `Attaching` → `Streaming` → `Detaching` → `Closed`,
/// with any state able to move to `Failing` → `Closed` on an unrecoverable
/// error. `Failing` is distinct from `Detaching` so a processor's drop
/// handler can tell a client-initiated stop from an internal failure when
/// deciding what to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
	Idle,
	Attaching,
	Streaming,
	Detaching,
	Failing,
	Closed,
}

impl ProcessorState {
	fn can_transition_to(self, next: ProcessorState) -> bool {
		use ProcessorState::*;
		match (self, next) {
			(_, Failing) | (_, Closed) if self != Closed => true,
			(Idle, Attaching) => true,
			(Attaching, Streaming) => true,
			(Streaming, Detaching) => true,
			(Detaching, Closed) => true,
			(Failing, Closed) => true,
			_ => false,
		}
	}
}

/// Tracks the processor state machine and rejects out-of-order transitions,
/// shared by every concrete processor (`mpegts`, `hls_ts`, `hls_fmp4`,
/// `dash`) instead of each reimplementing the same guard.
pub struct ProcessorStateMachine {
	state: Mutex<ProcessorState>,
}

impl ProcessorStateMachine {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(ProcessorState::Idle),
		}
	}

	pub fn current(&self) -> ProcessorState {
		*self.state.lock().unwrap()
	}

	pub fn transition(&self, next: ProcessorState) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		if !state.can_transition_to(next) {
			return Err(RelayError::Processor(format!(
				"invalid transition {state:?} -> {next:?}"
			)));
		}
		*state = next;
		Ok(())
	}
}

impl Default for ProcessorStateMachine {
	fn default() -> Self {
		Self::new()
	}
}

/// Common behavior every output processor implements: attach to a variant's
/// consumer handles, serve its container format to the client connection,
/// and detach cleanly (or fail) when the client goes away.
///
/// Each concrete processor (`MpegTsProcessor`, `HlsTsProcessor`,
/// `HlsFmp4Processor`, `DashProcessor`) owns this shared skeleton and adds
/// only the container-specific muxing logic, the way the four variants of
/// `spec.md` §4.6 share everything except their wire format.
#[async_trait::async_trait]
pub trait Processor: Send {
	/// Attaches to the given variant, seeking to the latest keyframe so a
	/// newly joining client doesn't have to wait for the next GOP boundary.
	async fn attach(&mut self) -> Result<()>;

	/// Produces the next chunk of container bytes to send to the client.
	/// Returns `Ok(None)` once the stream has ended cleanly.
	async fn next_chunk(&mut self) -> Result<Option<bytes::Bytes>>;

	async fn detach(&mut self);

	fn state(&self) -> ProcessorState;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn happy_path_transitions() {
		let sm = ProcessorStateMachine::new();
		sm.transition(ProcessorState::Attaching).unwrap();
		sm.transition(ProcessorState::Streaming).unwrap();
		sm.transition(ProcessorState::Detaching).unwrap();
		sm.transition(ProcessorState::Closed).unwrap();
	}

	#[test]
	fn any_state_can_fail() {
		let sm = ProcessorStateMachine::new();
		sm.transition(ProcessorState::Attaching).unwrap();
		sm.transition(ProcessorState::Streaming).unwrap();
		sm.transition(ProcessorState::Failing).unwrap();
		sm.transition(ProcessorState::Closed).unwrap();
	}

	#[test]
	fn rejects_skipping_attaching() {
		let sm = ProcessorStateMachine::new();
		assert!(sm.transition(ProcessorState::Streaming).is_err());
	}

	#[test]
	fn rejects_transition_out_of_closed() {
		let sm = ProcessorStateMachine::new();
		sm.transition(ProcessorState::Failing).unwrap();
		sm.transition(ProcessorState::Closed).unwrap();
		assert!(sm.transition(ProcessorState::Attaching).is_err());
	}
}
