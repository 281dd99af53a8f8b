use serde::Deserialize;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

// REST server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    // How far back the first sync of an account reaches
    #[serde(default = "default_sync_days")]
    pub days: i64,
    #[serde(rename = "check_interval", default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub url: Option<String>,
    #[serde(default = "default_search_index")]
    pub index: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            url: None,
            index: default_search_index(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            api_key: None,
            base_url: default_ai_base_url(),
            model: default_ai_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_sync_days() -> i64 {
    30
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_search_index() -> String {
    "emails".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

pub fn load_settings(path: &Path) -> Result<Config> {
    // Open the YAML file
    let file = File::open(path)
        .with_context(|| format!("cannot find settings at {}", path.display()))?;

    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config: Config = serde_yaml::from_reader(reader)
        .with_context(|| format!("cannot deserialize settings at {}", path.display()))?;

    Ok(config)
}
