//! Command-line interface and bootstrap config loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use bp_domain::config::Config;

#[derive(Parser)]
#[command(name = "baseplate", version, about = "Baseplate platform server")]
pub struct Cli {
    /// Path to the bootstrap config file.
    #[arg(short, long, default_value = "baseplate.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default).
    Serve,
    /// Bootstrap config helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the bootstrap config.
    Validate,
    /// Print the effective bootstrap config.
    Show,
}

/// Load the bootstrap config; a missing file yields the defaults so `config
/// show` can print a template.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Persist the bootstrap config (used to write back the generated node id).
pub fn store_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let raw = toml::to_string_pretty(config).context("serialising config")?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(raw) => println!("{raw}"),
        Err(err) => eprintln!("could not render config: {err}"),
    }
}

/// Validate and report; returns whether the config is usable.
pub fn validate(config: &Config) -> bool {
    use bp_domain::config::ConfigSeverity;

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => println!("error: {issue}"),
        }
    }
    let ok = !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error);
    if ok {
        println!("config ok");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/baseplate.toml")).unwrap();
        assert_eq!(config.db.port, 5432);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseplate.toml");

        let mut config = Config::default();
        config.db.user = "bp".into();
        config.cluster.node_id = uuid::Uuid::new_v4().to_string();
        store_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.db.user, "bp");
        assert_eq!(loaded.cluster.node_id, config.cluster.node_id);
    }
}
