//! Configuration view and validation: `shipwright config`.

use std::path::Path;

use anyhow::Result;
use console::style;
use shipwright::config::ShipwrightConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, config: &ShipwrightConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("# Effective values, including SHIPWRIGHT_* overrides");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", style("Configuration OK").green());
            } else {
                for warning in &warnings {
                    println!("{} {}", style("warning:").yellow().bold(), warning);
                }
            }
            let creds = [
                ("llm.api_key_env", config.llm.api_key_env.as_str()),
                ("github.token_env", config.github.token_env.as_str()),
            ];
            for (field, var) in creds {
                if std::env::var(var).is_err() {
                    println!("{} {} is not set ({})", style("note:").dim(), var, field);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(config_path, ShipwrightConfig::default().to_toml()?)?;
            println!("Wrote {}", config_path.display());
        }
    }
    Ok(())
}
