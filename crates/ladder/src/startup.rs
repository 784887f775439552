//! Startup checks module
//!
//! Provides preflight checks to verify system requirements before any job runs:
//! - ffprobe availability check
//! - FFmpeg availability and version check (requires 4.0+)

use crate::config::Config;
use std::process::{Command, Output};
use thiserror::Error;

/// Oldest ffmpeg major version whose scale filter and codec flags we rely on
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),
}

/// Run `<program> -version` and return its output if it succeeded
fn run_version(program: &str) -> Result<Output, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version exited with {}", program, output.status),
        });
    }

    Ok(output)
}

/// Check that a tool runs at all by invoking `<program> -version`
pub fn check_tool_available(program: &str) -> Result<(), StartupError> {
    run_version(program).map(|_| ())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.0-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // Major version is everything before the first '.' or '-'
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that ffmpeg runs and is at least [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version(program: &str) -> Result<u32, StartupError> {
    let output = run_version(program)?;

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    check_major_version(major_version)?;
    Ok(major_version)
}

fn check_major_version(major_version: u32) -> Result<(), StartupError> {
    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg availability and version
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.encode.ffmpeg_path)?;
    tracing::debug!(ffmpeg_major = major, "ffmpeg version ok");
    check_tool_available(&cfg.encode.ffprobe_path)?;
    Ok(())
}
