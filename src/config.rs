use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub mumin: MuminConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

#[derive(Debug, Deserialize)]
pub struct MuminConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_local_gallery")]
    pub local_gallery: String,
    #[serde(default = "default_debounce")]
    pub instructions_debounce: String,
}

fn default_version() -> u32 {
    1
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_local_gallery() -> String {
    "local-gallery.json".to_string()
}
fn default_debounce() -> String {
    "1s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "mumin.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_text_batch_size")]
    pub text_batch_size: u32,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_gemini_base_url(),
            text_model: default_text_model(),
            image_model: default_image_model(),
            temperature: default_temperature(),
            text_batch_size: default_text_batch_size(),
            timeout: default_timeout(),
        }
    }
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_text_model() -> String {
    "gemini-3-pro-preview".to_string()
}
fn default_image_model() -> String {
    "gemini-3-pro-image-preview".to_string()
}
fn default_temperature() -> f32 {
    1.2
}
fn default_text_batch_size() -> u32 {
    5
}
fn default_timeout() -> String {
    "5m".to_string()
}

/// How the image calls inside one style unit are issued. Units themselves always run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
    Bounded,
}

#[derive(Debug, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_count_per_style")]
    pub max_count_per_style: u32,
    #[serde(default = "default_max_total_images")]
    pub max_total_images: u32,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_count_per_style: default_max_count_per_style(),
            max_total_images: default_max_total_images(),
            mode: default_mode(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_count_per_style() -> u32 {
    10
}
fn default_max_total_images() -> u32 {
    30
}
fn default_mode() -> ExecutionMode {
    ExecutionMode::Parallel
}
fn default_max_concurrency() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket_dir: default_bucket_dir(),
            public_base_url: None,
            signing_key: None,
            signed_url_ttl: default_signed_url_ttl(),
        }
    }
}

fn default_bucket_dir() -> String {
    "generated-images".to_string()
}
fn default_signed_url_ttl() -> String {
    "1h".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct CloudConfig {
    /// Identity used for cloud reads and writes. Without it, only the local gallery is available.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Config {
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.mumin.data_dir.join(p)
        }
    }

    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.database.path)
    }

    pub fn local_gallery_path(&self) -> PathBuf {
        self.resolve(&self.mumin.local_gallery)
    }

    pub fn bucket_path(&self) -> PathBuf {
        self.resolve(&self.storage.bucket_dir)
    }

    /// Base URL signed object links are built on.
    pub fn public_base_url(&self) -> String {
        match &self.storage.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.mumin.listen),
        }
    }

    /// API key from config, falling back to `GOOGLE_AI_API_KEY`.
    pub fn gemini_api_key(&self) -> Option<String> {
        self.gemini
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("GOOGLE_AI_API_KEY").ok().filter(|k| !k.trim().is_empty()))
    }

    pub fn debounce_delay(&self) -> Duration {
        humantime::parse_duration(&self.mumin.instructions_debounce).unwrap_or(Duration::from_secs(1))
    }

    pub fn gemini_timeout(&self) -> Duration {
        humantime::parse_duration(&self.gemini.timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn signed_url_ttl(&self) -> Duration {
        humantime::parse_duration(&self.storage.signed_url_ttl).unwrap_or(Duration::from_secs(3600))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.mumin.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.mumin.version
        ))
        .into());
    }

    let generation = &config.generation;
    if generation.max_count_per_style == 0 || generation.max_total_images == 0 {
        return Err(ConfigError::Validation("generation limits must be at least 1".to_string()).into());
    }
    if generation.max_count_per_style > generation.max_total_images {
        return Err(ConfigError::Validation(format!(
            "max_count_per_style ({}) exceeds max_total_images ({})",
            generation.max_count_per_style, generation.max_total_images
        ))
        .into());
    }
    if generation.mode == ExecutionMode::Bounded && generation.max_concurrency == 0 {
        return Err(ConfigError::Validation("bounded mode requires max_concurrency >= 1".to_string()).into());
    }

    if !(0.0..=2.0).contains(&config.gemini.temperature) {
        return Err(ConfigError::Validation(format!(
            "gemini temperature {} out of range [0, 2]",
            config.gemini.temperature
        ))
        .into());
    }
    if config.gemini.text_batch_size == 0 {
        return Err(ConfigError::Validation("gemini text_batch_size must be at least 1".to_string()).into());
    }

    for (name, value) in [
        ("mumin.instructions_debounce", &config.mumin.instructions_debounce),
        ("gemini.timeout", &config.gemini.timeout),
        ("storage.signed_url_ttl", &config.storage.signed_url_ttl),
    ] {
        humantime::parse_duration(value)
            .map_err(|e| ConfigError::Validation(format!("{name} '{value}': {e}")))?;
    }

    if let Some(user_id) = &config.cloud.user_id
        && !is_path_safe_identifier(user_id)
    {
        return Err(ConfigError::Validation(format!("cloud user_id '{user_id}' is not a valid identifier")).into());
    }

    Ok(())
}

/// Non-empty, no `..`, and only `[A-Za-z0-9._-]`: it becomes a storage path
/// segment and appears unescaped in signed URLs.
fn is_path_safe_identifier(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("[mumin]\n").unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.generation.max_total_images, 30);
        assert_eq!(config.generation.mode, ExecutionMode::Parallel);
        assert_eq!(config.db_path(), PathBuf::from("./data/mumin.db"));
        assert_eq!(config.public_base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.debounce_delay(), Duration::from_secs(1));
        assert!(config.cloud.user_id.is_none());
    }

    #[test]
    fn rejects_unknown_version() {
        let config = parse_config("[mumin]\nversion = 2\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_inverted_limits() {
        let config = parse_config("[mumin]\n[generation]\nmax_count_per_style = 40\n").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_count_per_style"));
    }

    #[test]
    fn rejects_bad_duration() {
        let config = parse_config("[mumin]\ninstructions_debounce = \"soon\"\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn parses_bounded_mode() {
        let config = parse_config("[mumin]\n[generation]\nmode = \"bounded\"\nmax_concurrency = 2\n").unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.generation.mode, ExecutionMode::Bounded);
    }

    #[test]
    fn user_id_must_be_url_and_path_safe() {
        for bad in ["a?b", "a#b", "a%b", "a/b", "..", "a b", ""] {
            let config = parse_config(&format!("[mumin]\n[cloud]\nuser_id = \"{bad}\"\n")).unwrap();
            assert!(validate_config(&config).is_err(), "{bad:?}");
        }
        let config = parse_config("[mumin]\n[cloud]\nuser_id = \"user-1\"\n").unwrap();
        validate_config(&config).unwrap();
    }

    #[test]
    fn absolute_paths_are_kept() {
        let config = parse_config("[mumin]\n[database]\npath = \"/var/lib/mumin.db\"\n").unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/mumin.db"));
    }
}
