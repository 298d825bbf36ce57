//! `pyrunner config`: print sample or effective configuration

use anyhow::{bail, Context, Result};
use pyrunner_config::PyrunnerConfig;

pub fn print_sample() {
    print!("{}", PyrunnerConfig::generate_sample());
}

pub fn show(config: &PyrunnerConfig, format: &str) -> Result<()> {
    println!("{}", render(config, format)?);
    Ok(())
}

fn render(config: &PyrunnerConfig, format: &str) -> Result<String> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            serde_yaml::to_string(config).context("Failed to serialize configuration to YAML")
        }
        "json" => serde_json::to_string_pretty(config)
            .context("Failed to serialize configuration to JSON"),
        other => bail!("Unsupported format '{}': expected yaml or json", other),
    }
}
