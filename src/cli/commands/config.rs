//! Config command implementation.

use crate::cli::{ConfigAction, Output};
use crate::config::Settings;
use anyhow::Result;
use std::path::PathBuf;

/// Run the config command.
pub fn run_config(
    action: &ConfigAction,
    config_path: Option<&PathBuf>,
    settings: Settings,
) -> Result<()> {
    let path = config_path.cloned().unwrap_or_else(Settings::default_config_path);

    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&settings)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{}", toml_str);
        }

        ConfigAction::Init => {
            if path.exists() {
                Output::warning(&format!("Config already exists at {}", path.display()));
                return Ok(());
            }
            Settings::default().save_to(&path)?;
            Output::success(&format!("Created default config at {}", path.display()));
            Output::info("Edit it to set your channel, storage budget and knowledge base URL.");
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }

    Ok(())
}
