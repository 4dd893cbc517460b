pub mod args;
pub mod config;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub use config::TranscoderConfig;

use crate::error::{RelayError, Result};
use crate::profile::RelayProfile;

/// Lifecycle wrapper around an on-demand FFmpeg subprocess: spawned the
/// first time a transcoded variant is requested, fed MPEG-TS on stdin,
/// read back on stdout, and torn down once the variant's refcount drops to
/// zero. Restart attempts back off exponentially and give up after
/// `max_restarts`, at which point the caller falls back to the fallback
/// stream.
pub struct Transcoder {
	config: TranscoderConfig,
	profile: RelayProfile,
	child: Option<Child>,
	restarts: u32,
	backoff: Duration,
}

impl Transcoder {
	pub fn new(config: TranscoderConfig, profile: RelayProfile) -> Self {
		let backoff = config.initial_backoff;
		Self {
			config,
			profile,
			child: None,
			restarts: 0,
			backoff,
		}
	}

	/// Spawns the FFmpeg process and waits up to `startup_timeout` for its
	/// first byte on stdout, confirming it didn't immediately exit.
	pub async fn start(&mut self) -> Result<()> {
		let args = args::build_args(&self.profile);
		let mut command = Command::new(&self.config.ffmpeg_path);
		command
			.args(&args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let mut child = command
			.spawn()
			.map_err(|e| RelayError::Transcoder(format!("spawn failed: {e}")))?;

		let stdout = child
			.stdout
			.as_mut()
			.ok_or_else(|| RelayError::Transcoder("missing stdout pipe".into()))?;

		let mut probe = [0u8; 1];
		let probed = timeout(self.config.startup_timeout, stdout.read(&mut probe)).await;
		match probed {
			Ok(Ok(0)) => {
				return Err(RelayError::Transcoder(
					"ffmpeg exited before producing output".into(),
				));
			}
			Ok(Ok(_)) => {}
			Ok(Err(e)) => return Err(RelayError::Transcoder(format!("stdout read failed: {e}"))),
			Err(_) => {
				let _ = child.kill().await;
				return Err(RelayError::Transcoder("startup timed out".into()));
			}
		}

		self.child = Some(child);
		self.restarts = 0;
		self.backoff = self.config.initial_backoff;
		Ok(())
	}

	/// Restarts after a failure, honoring exponential backoff and the
	/// restart ceiling. Returns [`RelayError::Transcoder`] once
	/// `max_restarts` is exceeded — callers should stop retrying and
	/// switch the variant to the fallback stream.
	pub async fn restart(&mut self) -> Result<()> {
		if self.restarts >= self.config.max_restarts {
			return Err(RelayError::Transcoder("max restarts exceeded".into()));
		}
		self.restarts += 1;
		tokio::time::sleep(self.backoff).await;
		self.backoff = (self.backoff * 2).min(self.config.max_backoff);
		self.start().await
	}

	pub async fn write_input(&mut self, data: &[u8]) -> Result<()> {
		let child = self.child.as_mut().ok_or(RelayError::Closed)?;
		let stdin = child
			.stdin
			.as_mut()
			.ok_or_else(|| RelayError::Transcoder("missing stdin pipe".into()))?;
		stdin
			.write_all(data)
			.await
			.map_err(|e| RelayError::Transcoder(format!("stdin write failed: {e}")))
	}

	pub async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize> {
		let child = self.child.as_mut().ok_or(RelayError::Closed)?;
		let stdout = child
			.stdout
			.as_mut()
			.ok_or_else(|| RelayError::Transcoder("missing stdout pipe".into()))?;
		stdout
			.read(buf)
			.await
			.map_err(|e| RelayError::Transcoder(format!("stdout read failed: {e}")))
	}

	/// Sends SIGTERM and waits `shutdown_grace` for a clean exit before
	/// sending SIGKILL, matching how long-lived subprocess supervisors in
	/// this workspace tear down child processes.
	pub async fn shutdown(&mut self) {
		let Some(mut child) = self.child.take() else {
			return;
		};
		drop(child.stdin.take());

		#[cfg(unix)]
		if let Some(pid) = child.id() {
			unsafe {
				libc::kill(pid as i32, libc::SIGTERM);
			}
		}

		if timeout(self.config.shutdown_grace, child.wait()).await.is_err() {
			let _ = child.kill().await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::profile::{ContainerHint, DeliveryMode};
	use std::collections::BTreeMap;

	fn profile() -> RelayProfile {
		RelayProfile {
			id: "test".into(),
			target_video: None,
			target_audio: None,
			container_hint: ContainerHint::MpegTs,
			delivery_mode: DeliveryMode::Transcode,
			transcoder_args: BTreeMap::new(),
		}
	}

	#[tokio::test]
	async fn missing_binary_reports_spawn_error() {
		let config = TranscoderConfig {
			ffmpeg_path: "/nonexistent/ffmpeg-binary-that-does-not-exist".into(),
			..Default::default()
		};
		let mut transcoder = Transcoder::new(config, profile());
		let err = transcoder.start().await.unwrap_err();
		assert!(matches!(err, RelayError::Transcoder(_)));
	}

	#[tokio::test]
	async fn restart_respects_ceiling() {
		let config = TranscoderConfig {
			max_restarts: 0,
			initial_backoff: Duration::from_millis(1),
			..Default::default()
		};
		let mut transcoder = Transcoder::new(config, profile());
		let err = transcoder.restart().await.unwrap_err();
		assert!(matches!(err, RelayError::Transcoder(_)));
	}
}
