//! FFmpeg encoder module
//!
//! Builds and runs the ffmpeg command that produces one rendition: a scale
//! filter to the tier's frame size and a fixed H.264/AAC MP4 profile.

use super::{EncodeFailure, TranscodeRequest, Transcoder};
use crate::process::{run_supervised, stderr_tail, Supervised};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Video codec for every rendition
pub const VIDEO_CODEC: &str = "libx264";

/// Audio codec for every rendition
pub const AUDIO_CODEC: &str = "aac";

/// Container format for every rendition
pub const CONTAINER_FORMAT: &str = "mp4";

/// Lines of ffmpeg stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 8;

/// Build an ffmpeg command for one rendition
///
/// Creates a Command configured with:
/// - Input and output paths (output is overwritten if present)
/// - A scale filter to the requested width and height
/// - Fixed video/audio codecs and container
/// - Thread count from the concurrency plan
pub fn build_ffmpeg_command(program: &Path, request: &TranscodeRequest, threads: u32) -> Command {
    let mut cmd = Command::new(program);

    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]);
    cmd.arg("-i").arg(&request.input_path);

    cmd.arg("-vf").arg(format!(
        "scale={}:{}",
        request.target.width, request.target.height
    ));

    cmd.arg("-c:v").arg(VIDEO_CODEC);
    cmd.arg("-c:a").arg(AUDIO_CODEC);
    cmd.arg("-threads").arg(threads.to_string());
    cmd.arg("-f").arg(CONTAINER_FORMAT);

    cmd.arg(&request.output_path);

    cmd
}

/// [`Transcoder`] that shells out to ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    timeout: Duration,
    threads: u32,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration, threads: u32) -> Self {
        Self {
            program: program.into(),
            timeout,
            threads: threads.max(1),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeFailure> {
        let mut cmd = build_ffmpeg_command(&self.program, request, self.threads);

        let output = match run_supervised(&mut cmd, self.timeout, cancel).await? {
            Supervised::Finished(output) => output,
            Supervised::TimedOut => return Err(EncodeFailure::TimedOut(self.timeout)),
            Supervised::Cancelled => return Err(EncodeFailure::Cancelled),
        };

        if output.status.success() {
            debug!(output = %request.output_path.display(), "ffmpeg finished");
            return Ok(());
        }

        match output.status.code() {
            Some(code) => Err(EncodeFailure::Exited {
                code,
                stderr: stderr_tail(&output, STDERR_TAIL_LINES),
            }),
            None => Err(EncodeFailure::Terminated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::Resolution;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_.-]{1,20}(/[a-zA-Z0-9_.-]{1,20}){0,3}").unwrap()
    }

    fn request(input: &str, output: &str, width: u32, height: u32) -> TranscodeRequest {
        TranscodeRequest {
            input_path: PathBuf::from(input),
            target: Resolution::new(width, height),
            output_path: PathBuf::from(output),
        }
    }

    // *For any* input/output paths, target size and thread count, the built
    // command carries the scale filter, the fixed codec profile and writes to
    // the requested output as its final argument.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            input_path in path_strategy(),
            output_path in path_strategy(),
            width in 1u32..8000,
            height in 1u32..5000,
            threads in 1u32..64,
        ) {
            let req = request(&input_path, &output_path, width, height);
            let cmd = build_ffmpeg_command(Path::new("ffmpeg"), &req, threads);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("ffmpeg"));
            prop_assert!(has_flag_with_value(&args, "-i", &input_path));
            prop_assert!(
                has_flag_with_value(&args, "-vf", &format!("scale={}:{}", width, height)),
                "missing scale filter, args: {:?}", args
            );
            prop_assert!(has_flag_with_value(&args, "-c:v", VIDEO_CODEC));
            prop_assert!(has_flag_with_value(&args, "-c:a", AUDIO_CODEC));
            prop_assert!(has_flag_with_value(&args, "-f", CONTAINER_FORMAT));
            prop_assert!(has_flag_with_value(&args, "-threads", &threads.to_string()));
            prop_assert!(args.iter().any(|a| a == "-y"));
            prop_assert_eq!(args.last(), Some(&output_path));
        }
    }

    #[test]
    fn test_threads_never_zero() {
        let transcoder = FfmpegTranscoder::new("ffmpeg", Duration::from_secs(1), 0);
        assert_eq!(transcoder.threads, 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let transcoder =
            FfmpegTranscoder::new("/definitely/not/ffmpeg", Duration::from_secs(1), 1);
        let result = transcoder
            .transcode(
                &request("/in.mkv", "/out.mp4", 1280, 720),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(EncodeFailure::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        // `false` ignores its arguments and exits 1
        let transcoder = FfmpegTranscoder::new("false", Duration::from_secs(10), 1);
        let result = transcoder
            .transcode(
                &request("/in.mkv", "/out.mp4", 1280, 720),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(EncodeFailure::Exited { code: 1, .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transcoder = FfmpegTranscoder::new("ffmpeg", Duration::from_secs(1), 1);
        let result = transcoder
            .transcode(&request("/in.mkv", "/out.mp4", 640, 480), &cancel)
            .await;
        assert!(matches!(result, Err(EncodeFailure::Cancelled)));
    }
}
