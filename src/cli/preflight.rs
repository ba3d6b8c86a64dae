//! Pre-flight checks before starting work.
//!
//! Catches missing tools and credentials up front instead of letting every
//! task fail on its first attempt.

use crate::config::Settings;
use crate::error::{Result, VidwikiError};
use crate::openai::is_api_key_configured;
use std::process::Command;

/// Commands with external requirements.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// The scheduler needs every tool and the speech API key.
    Run,
    /// Discovery and enqueueing only need yt-dlp.
    Discover,
    /// Queue inspection needs nothing external.
    Inspect,
}

/// Run pre-flight checks for the given operation.
pub fn check(operation: Operation, settings: &Settings) -> Result<()> {
    match operation {
        Operation::Run => {
            check_api_key()?;
            check_tool(&settings.source.yt_dlp)?;
            check_tool("ffmpeg")?;
            check_tool("ffprobe")?;
        }
        Operation::Discover => {
            check_tool(&settings.source.yt_dlp)?;
        }
        Operation::Inspect => {}
    }
    Ok(())
}

fn check_api_key() -> Result<()> {
    if is_api_key_configured() {
        Ok(())
    } else {
        Err(VidwikiError::Config(
            "OPENAI_API_KEY not set. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        ))
    }
}

/// Check that an external tool runs.
fn check_tool(name: &str) -> Result<()> {
    // ffmpeg/ffprobe use -version (single dash), others use --version
    let version_arg = match name {
        "ffmpeg" | "ffprobe" => "-version",
        _ => "--version",
    };
    match Command::new(name).arg(version_arg).output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(_) => Err(VidwikiError::ToolNotFound(format!(
            "{} is installed but not working correctly",
            name
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(VidwikiError::ToolNotFound(name.to_string()))
        }
        Err(e) => Err(VidwikiError::ToolNotFound(format!("{}: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_has_no_requirements() {
        assert!(check(Operation::Inspect, &Settings::default()).is_ok());
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let missing = "vidwiki-definitely-missing-tool";
        let err = check_tool(missing).unwrap_err();
        assert!(matches!(err, VidwikiError::ToolNotFound(name) if name == missing));
    }
}
