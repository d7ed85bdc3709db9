use std::{collections::HashMap, fs::File, path::Path};

use anyhow::{bail, Context};
use serde::Deserialize;

fn default_sign_limit_interval() -> u64 {
    600
}

/// The `linked_network` key accepts either the mapping itself or a path to
/// a YAML file containing it.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum LinkedNetwork {
    Inline(HashMap<String, String>),
    Path(String),
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub bot_token: String,
    /// `[type, path]` where type is "json" or "sqlite".
    pub database: Vec<String>,
    #[serde(default)]
    pub blacklist_contact: String,
    #[serde(default)]
    pub enable_signing: bool,
    #[serde(default)]
    pub allow_remove_command: bool,
    #[serde(default)]
    pub allow_contacts: bool,
    #[serde(default)]
    pub allow_documents: bool,
    /// Hours a fresh account must wait before sending media.
    #[serde(default)]
    pub media_limit_period: Option<u64>,
    #[serde(default = "default_sign_limit_interval")]
    pub sign_limit_interval: u64,
    /// Hex string mixed into obfuscated ids.
    #[serde(default)]
    pub secret_salt: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub linked_network: Option<LinkedNetwork>,
}

impl Config {
    /// The resolved linked-network mapping; empty if not configured.
    pub fn linked_network(&self) -> HashMap<String, String> {
        match &self.linked_network {
            Some(LinkedNetwork::Inline(map)) => map.clone(),
            _ => HashMap::new(),
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let file =
        File::open(path).with_context(|| format!("cannot open config {}", path.display()))?;
    let mut config: Config = serde_yaml::from_reader(file).context("malformed config")?;
    if config.bot_token.trim().is_empty() {
        bail!("no bot token specified");
    }
    if config.database.len() < 2 {
        bail!("database must be configured as [type, path]");
    }
    // pull the linked network in from its own file if given as a path
    if let Some(LinkedNetwork::Path(ln_path)) = &config.linked_network {
        let file = File::open(ln_path)
            .with_context(|| format!("cannot open linked_network file {ln_path}"))?;
        let map: HashMap<String, String> =
            serde_yaml::from_reader(file).context("malformed linked_network file")?;
        config.linked_network = Some(LinkedNetwork::Inline(map));
    }
    Ok(config)
}
