use crate::model::{AudioCodec, VideoCodec};
use crate::profile::{ContainerHint, RelayProfile};

fn video_encoder_name(codec: VideoCodec) -> &'static str {
	match codec {
		VideoCodec::H264 => "libx264",
		VideoCodec::H265 => "libx265",
		VideoCodec::Av1 => "libsvtav1",
		VideoCodec::Vp9 => "libvpx-vp9",
	}
}

fn audio_encoder_name(codec: AudioCodec) -> &'static str {
	match codec {
		AudioCodec::Aac => "aac",
		AudioCodec::Ac3 => "ac3",
		AudioCodec::Eac3 => "eac3",
		AudioCodec::Mp3 => "libmp3lame",
		AudioCodec::Opus => "libopus",
	}
}

/// Whether a profile's target produces a stdout fMP4 stream rather than
/// MPEG-TS: codecs MPEG-TS can't carry (AV1, VP9, Opus) force it, and a
/// profile aimed at an fMP4/DASH container asks for it directly so the
/// output processor never has to re-wrap a TS stream into CMAF itself.
pub fn output_is_fmp4(profile: &RelayProfile) -> bool {
	matches!(profile.target_video, Some(VideoCodec::Av1 | VideoCodec::Vp9))
		|| matches!(profile.target_audio, Some(AudioCodec::Opus))
		|| matches!(profile.container_hint, ContainerHint::HlsFmp4 | ContainerHint::Dash)
}

/// Builds the deterministic FFmpeg command line for one transcode variant:
/// stdin carries the demuxed MPEG-TS feed, stdout carries the transcoded
/// output (MPEG-TS or fragmented MP4, per [`output_is_fmp4`]), and encoder
/// selection follows the profile's target codecs. `transcoder_args` entries
/// are appended verbatim as `-key value` pairs after the deterministic core,
/// letting a profile add codec-specific tuning (`-preset`, `-crf`, ...)
/// without the core needing to know about them.
pub fn build_args(profile: &RelayProfile) -> Vec<String> {
	let mut args = vec![
		"-hide_banner".to_string(),
		"-loglevel".to_string(),
		"warning".to_string(),
		"-i".to_string(),
		"pipe:0".to_string(),
	];

	match profile.target_video {
		Some(codec) => {
			args.push("-c:v".to_string());
			args.push(video_encoder_name(codec).to_string());
		}
		None => args.push("-vn".to_string()),
	}

	match profile.target_audio {
		Some(codec) => {
			args.push("-c:a".to_string());
			args.push(audio_encoder_name(codec).to_string());
		}
		None => args.push("-an".to_string()),
	}

	for (key, value) in &profile.transcoder_args {
		args.push(format!("-{key}"));
		if !value.is_empty() {
			args.push(value.clone());
		}
	}

	if output_is_fmp4(profile) {
		args.push("-f".to_string());
		args.push("mp4".to_string());
		args.push("-movflags".to_string());
		args.push("frag_keyframe+empty_moov+default_base_moof".to_string());
	} else {
		args.push("-f".to_string());
		args.push("mpegts".to_string());
	}
	args.push("pipe:1".to_string());
	args
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::profile::{ContainerHint, DeliveryMode};
	use std::collections::BTreeMap;

	fn profile() -> RelayProfile {
		RelayProfile {
			id: "720p".into(),
			target_video: Some(VideoCodec::H264),
			target_audio: Some(AudioCodec::Aac),
			container_hint: ContainerHint::MpegTs,
			delivery_mode: DeliveryMode::Transcode,
			transcoder_args: BTreeMap::new(),
		}
	}

	#[test]
	fn builds_stdin_stdout_pipeline() {
		let args = build_args(&profile());
		assert!(args.contains(&"pipe:0".to_string()));
		assert!(args.contains(&"pipe:1".to_string()));
		assert!(args.contains(&"libx264".to_string()));
		assert!(args.contains(&"aac".to_string()));
	}

	#[test]
	fn omits_video_track_when_no_target() {
		let mut p = profile();
		p.target_video = None;
		let args = build_args(&p);
		assert!(args.contains(&"-vn".to_string()));
	}

	#[test]
	fn appends_extra_args() {
		let mut p = profile();
		p.transcoder_args.insert("preset".into(), "veryfast".into());
		let args = build_args(&p);
		assert!(args.contains(&"-preset".to_string()));
		assert!(args.contains(&"veryfast".to_string()));
	}

	#[test]
	fn av1_target_forces_fmp4_output() {
		let mut p = profile();
		p.target_video = Some(VideoCodec::Av1);
		assert!(output_is_fmp4(&p));
		let args = build_args(&p);
		assert!(args.contains(&"mp4".to_string()));
		assert!(!args.contains(&"mpegts".to_string()));
	}

	#[test]
	fn h264_target_keeps_mpegts_output() {
		assert!(!output_is_fmp4(&profile()));
	}
}
