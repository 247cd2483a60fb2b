//! Platform configuration: a TOML file whose tables declare adapters.
//!
//! A table named `md-*`, `ec-*` or `cm-*` declares a market-data,
//! exchange-connectivity or commission adapter respectively. Its `driver`
//! key (legacy alias `sofile`) names a factory in the compile-time adapter
//! registry; the remaining keys become the adapter's configuration map.
//! Top-level scalars act as defaults for the matching CLI options.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("adapter section [{0}] has no driver key")]
    MissingDriver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    MarketData,
    ExchangeConnectivity,
    Commission,
}

/// One adapter section.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    /// The section name; doubles as the adapter's registered name.
    pub name: String,
    /// Factory name in the adapter registry.
    pub driver: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub adapters: Vec<AdapterConfig>,
    /// Top-level scalar settings (CLI defaults).
    pub settings: HashMap<String, String>,
}

fn value_to_string(v: &toml::Value) -> String {
    match v {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root: toml::Value = text.parse()?;
        let mut config = Config::default();
        let Some(table) = root.as_table() else {
            return Ok(config);
        };
        for (name, value) in table {
            match value.as_table() {
                None => {
                    config
                        .settings
                        .insert(name.to_lowercase(), value_to_string(value));
                }
                Some(section) => {
                    let kind = if name.starts_with("md-") {
                        AdapterKind::MarketData
                    } else if name.starts_with("ec-") {
                        AdapterKind::ExchangeConnectivity
                    } else if name.starts_with("cm-") {
                        AdapterKind::Commission
                    } else {
                        warn!("unknown config section [{name}], ignored");
                        continue;
                    };
                    let mut params: HashMap<String, String> = section
                        .iter()
                        .map(|(k, v)| (k.to_lowercase(), value_to_string(v)))
                        .collect();
                    let driver = params
                        .remove("driver")
                        .or_else(|| params.remove("sofile"))
                        .ok_or_else(|| ConfigError::MissingDriver(name.clone()))?;
                    config.adapters.push(AdapterConfig {
                        kind,
                        name: name.clone(),
                        driver,
                        params,
                    });
                }
            }
        }
        Ok(config)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}
