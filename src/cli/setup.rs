//! Configuration commands
//!
//! `init` writes the configuration file, prompting for anything not given
//! on the command line. `config` prints the effective configuration.

use dvpn_core::{
    config::{toml_config, EngineConfig, DEFAULT_ENGINE_ADDRESS},
    error::{ConfigError, DvpnError},
    types::ServiceType,
};
use std::io::{self, Write};

/// Run the init command
pub fn run_init(
    address: Option<String>,
    identity: Option<String>,
    service: Option<ServiceType>,
    force: bool,
) -> Result<(), DvpnError> {
    println!("dvpn setup");
    println!("==========");
    println!();

    if !force && toml_config::config_exists()? {
        println!("⚠️  Existing configuration detected.");
        if !prompt_yes_no("Overwrite existing configuration?", false)? {
            println!("Setup cancelled.");
            return Ok(());
        }
        println!();
    }

    let address = match address {
        Some(address) => address,
        None => prompt_with_default("Engine address", DEFAULT_ENGINE_ADDRESS)?,
    };
    let identity = match identity {
        Some(identity) => Some(identity),
        None => Some(prompt_with_default("Consumer identity (optional)", "")?),
    }
    .filter(|id| !id.trim().is_empty());
    let service_type = match service {
        Some(service) => service,
        None => prompt_with_default("Service type", ServiceType::default().as_str())?
            .parse()
            .map_err(|message| ConfigError::ValidationError { message })?,
    };

    let mut config = toml_config::load_config_or_default().unwrap_or_default();
    config.engine = EngineConfig {
        address,
        identity,
        service_type,
        ..config.engine
    };

    let path = toml_config::save_config(&config)?;

    println!("✅ Configuration saved to {}", path.display());
    println!();
    println!("You can now use:");
    println!("  dvpn status     - Check the engine");
    println!("  dvpn nodes      - List available nodes");
    println!("  dvpn connect    - Connect to a node");
    Ok(())
}

/// Print the effective configuration as TOML
pub fn run_config() -> Result<(), DvpnError> {
    let path = toml_config::get_config_path()?;
    let config = toml_config::load_config_or_default()?;

    if path.exists() {
        println!("# {}", path.display());
    } else {
        println!("# {} (not found, showing defaults)", path.display());
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Prompt for a value, falling back to `default` on empty input
fn prompt_with_default(prompt: &str, default: &str) -> Result<String, DvpnError> {
    let prompt_text = if default.is_empty() {
        format!("{}: ", prompt)
    } else {
        format!("{} [{}]: ", prompt, default)
    };

    let input = prompt_input(&prompt_text)?;
    if input.trim().is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input.trim().to_string())
    }
}

/// Prompt for yes/no with default
fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool, DvpnError> {
    let default_indicator = if default_yes { "[Y/n]" } else { "[y/N]" };
    let prompt_text = format!("{} {}: ", prompt, default_indicator);

    loop {
        let input = prompt_input(&prompt_text)?.to_lowercase();

        match input.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            "" => return Ok(default_yes),
            _ => {
                println!("Please enter 'y' for yes or 'n' for no.");
                continue;
            }
        }
    }
}

/// Low-level input prompting
fn prompt_input(prompt: &str) -> Result<String, DvpnError> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim_end().to_string())
}
