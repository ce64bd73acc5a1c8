//! Media duration probing used by the first-chunk content policy.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Reports the playback duration of a (possibly partial) media file.
/// `None` means no duration could be measured, e.g. the file is not media.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration(&self, path: &Path) -> Option<Duration>;
}

/// Probe that never measures anything; disables the duration policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

#[async_trait]
impl DurationProbe for NoProbe {
    async fn duration(&self, _path: &Path) -> Option<Duration> {
        None
    }
}

/// Runs `ffprobe` against the file and reads the container duration.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    program: PathBuf,
}

impl Default for Ffprobe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl Ffprobe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for Ffprobe {
    async fn duration(&self, path: &Path) -> Option<Duration> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                parse_duration(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(
                    "ffprobe could not read {:?}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                debug!("Failed to run {:?}: {}", &self.program, e);
                None
            }
        }
    }
}

fn parse_duration(stdout: &str) -> Option<Duration> {
    let seconds = stdout.lines().next()?.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Whole minutes of `duration`, rounded down, exceed `limit_minutes`.
pub fn exceeds_limit(duration: Duration, limit_minutes: u64) -> bool {
    duration.as_secs() / 60 > limit_minutes
}
