//! Doctor command - verify system requirements and configuration.

use crate::cli::output::format_size;
use crate::cli::Output;
use crate::config::Settings;
use crate::pipeline::KB_API_KEY_ENV;
use console::style;
use std::process::Command;

/// Check result for a single item.
#[derive(Debug)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckResult {
    fn ok(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: message.to_string(),
            hint: None,
        }
    }

    fn warning(name: &str, message: &str, hint: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    fn error(name: &str, message: &str, hint: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    fn print(&self) {
        let icon = match self.status {
            CheckStatus::Ok => style("✓").green(),
            CheckStatus::Warning => style("!").yellow(),
            CheckStatus::Error => style("✗").red(),
        };

        println!("  {} {} - {}", icon, style(&self.name).bold(), self.message);

        if let Some(hint) = &self.hint {
            println!("    {} {}", style("→").dim(), style(hint).dim());
        }
    }
}

/// Run all diagnostic checks.
pub fn run_doctor(settings: &Settings) -> anyhow::Result<()> {
    Output::header("vidwiki doctor");
    println!();
    println!("Checking system requirements and configuration...\n");

    let mut checks = Vec::new();

    println!("{}", style("External Tools").bold());
    let tools = vec![
        check_tool("yt-dlp", &settings.source.yt_dlp, "--version", install_hint_ytdlp()),
        check_tool("ffmpeg", "ffmpeg", "-version", install_hint_ffmpeg()),
        check_tool("ffprobe", "ffprobe", "-version", install_hint_ffmpeg()),
    ];
    print_section(&mut checks, tools);

    println!("{}", style("Services").bold());
    print_section(
        &mut checks,
        vec![check_openai_api_key(), check_knowledge_base(settings)],
    );

    println!("{}", style("Storage").bold());
    print_section(&mut checks, check_directories(settings));

    println!("{}", style("Configuration").bold());
    print_section(&mut checks, vec![check_config_file(), check_settings(settings)]);

    let errors = checks.iter().filter(|c| c.status == CheckStatus::Error).count();
    let warnings = checks.iter().filter(|c| c.status == CheckStatus::Warning).count();

    if errors > 0 {
        Output::error(&format!(
            "{} error(s) found. Fix them before running the scheduler.",
            errors
        ));
        std::process::exit(1);
    } else if warnings > 0 {
        Output::warning(&format!("All checks passed with {} warning(s).", warnings));
    } else {
        Output::success("All checks passed. vidwiki is ready to run.");
    }

    Ok(())
}

fn print_section(all: &mut Vec<CheckResult>, section: Vec<CheckResult>) {
    for check in &section {
        check.print();
    }
    println!();
    all.extend(section);
}

/// Check if an external tool is available.
fn check_tool(name: &str, program: &str, version_arg: &str, hint: &str) -> CheckResult {
    match Command::new(program).arg(version_arg).output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("installed")
                .trim()
                .to_string();

            CheckResult::ok(name, &truncate(&version, 50))
        }
        Ok(_) => CheckResult::error(name, "installed but not working", hint),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            CheckResult::error(name, "not found", hint)
        }
        Err(e) => CheckResult::error(name, &format!("error: {}", e), hint),
    }
}

/// Check if OpenAI API key is configured.
fn check_openai_api_key() -> CheckResult {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if key.starts_with("sk-") && key.len() > 20 => {
            CheckResult::ok("OPENAI_API_KEY", &format!("configured ({})", mask_key(&key)))
        }
        Ok(key) if key.is_empty() => CheckResult::error(
            "OPENAI_API_KEY",
            "empty",
            "Set with: export OPENAI_API_KEY='sk-...'",
        ),
        Ok(_) => CheckResult::warning(
            "OPENAI_API_KEY",
            "set but format looks unusual",
            "Expected format: sk-... (OpenAI API key)",
        ),
        Err(_) => CheckResult::error(
            "OPENAI_API_KEY",
            "not set",
            "Set with: export OPENAI_API_KEY='sk-...'",
        ),
    }
}

/// Check the knowledge base endpoint and credentials.
fn check_knowledge_base(settings: &Settings) -> CheckResult {
    let kb = &settings.knowledge_base;
    if url::Url::parse(&kb.endpoint).is_err() {
        return CheckResult::error(
            "Knowledge base",
            &format!("invalid endpoint '{}'", kb.endpoint),
            "Set knowledge_base.endpoint to an http(s) URL",
        );
    }

    let has_key = kb.api_key.as_deref().is_some_and(|k| !k.is_empty())
        || std::env::var(KB_API_KEY_ENV).is_ok_and(|k| !k.is_empty());
    if has_key {
        CheckResult::ok(
            "Knowledge base",
            &format!("{} (collection '{}')", kb.endpoint, kb.collection),
        )
    } else {
        CheckResult::warning(
            "Knowledge base",
            &format!("{} without credentials", kb.endpoint),
            &format!("Set knowledge_base.api_key or export {}", KB_API_KEY_ENV),
        )
    }
}

/// Check data directories.
fn check_directories(settings: &Settings) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let data_dir = settings.data_dir();
    if data_dir.exists() {
        results.push(CheckResult::ok(
            "Data directory",
            &format!("{}", data_dir.display()),
        ));
    } else {
        results.push(CheckResult::warning(
            "Data directory",
            &format!("{} (will be created)", data_dir.display()),
            "Directory will be created on first use",
        ));
    }

    let db_path = settings.database_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path)
            .map(|m| format_size(m.len()))
            .unwrap_or_else(|_| "unknown size".to_string());
        results.push(CheckResult::ok(
            "Database",
            &format!("{} ({})", db_path.display(), size),
        ));
    } else {
        results.push(CheckResult::warning(
            "Database",
            &format!("{} (not created yet)", db_path.display()),
            "Database will be created on first use",
        ));
    }

    results.push(CheckResult::ok(
        "Budget",
        &format!(
            "{} (cleanup at {:.0}%)",
            format_size(settings.storage.budget_bytes),
            settings.storage.cleanup_threshold * 100.0
        ),
    ));
    if let Some(cold) = settings.cold_dir() {
        results.push(CheckResult::ok("Cold tier", &format!("{}", cold.display())));
    }

    results
}

/// Check if config file exists.
fn check_config_file() -> CheckResult {
    let config_path = Settings::default_config_path();
    if config_path.exists() {
        CheckResult::ok("Config file", &format!("{}", config_path.display()))
    } else {
        CheckResult::warning(
            "Config file",
            "using defaults",
            "Create with: vidwiki config init",
        )
    }
}

/// Validate the loaded settings.
fn check_settings(settings: &Settings) -> CheckResult {
    match settings.validate() {
        Ok(()) => CheckResult::ok("Settings", "valid"),
        Err(e) => {
            CheckResult::error("Settings", &e.to_string(), "Fix the value in the config file")
        }
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let head: String = chars.iter().take(7).collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{}...{}", head, tail)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Platform-specific install hint for yt-dlp.
fn install_hint_ytdlp() -> &'static str {
    if cfg!(target_os = "macos") {
        "Install with: brew install yt-dlp"
    } else if cfg!(target_os = "linux") {
        "Install with: pip install yt-dlp (or your package manager)"
    } else {
        "Install from: https://github.com/yt-dlp/yt-dlp"
    }
}

/// Platform-specific install hint for ffmpeg.
fn install_hint_ffmpeg() -> &'static str {
    if cfg!(target_os = "macos") {
        "Install with: brew install ffmpeg"
    } else if cfg!(target_os = "linux") {
        "Install with: sudo apt install ffmpeg (or your package manager)"
    } else {
        "Install from: https://ffmpeg.org/download.html"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_ok() {
        let result = CheckResult::ok("test", "passed");
        assert_eq!(result.status, CheckStatus::Ok);
        assert!(result.hint.is_none());
    }

    #[test]
    fn test_check_result_error() {
        let result = CheckResult::error("test", "failed", "fix it");
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.hint, Some("fix it".to_string()));
    }

    #[test]
    fn test_mask_key_keeps_ends() {
        assert_eq!(mask_key("sk-abcdefghijklmnopqrstuvwxyz"), "sk-abcd...wxyz");
        assert_eq!(mask_key("abc"), "abc...abc");
    }

    #[test]
    fn test_missing_tool_is_an_error() {
        let result = check_tool("missing", "vidwiki-no-such-binary", "--version", "install it");
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.message, "not found");
    }

    #[test]
    fn test_invalid_endpoint_is_an_error() {
        let mut settings = Settings::default();
        settings.knowledge_base.endpoint = "not a url".to_string();
        assert_eq!(check_knowledge_base(&settings).status, CheckStatus::Error);
    }
}
