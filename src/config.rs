use std::path::PathBuf;
use std::str::FromStr;

use chrono::{FixedOffset, Local, Offset};

/// Runtime settings, read from the environment (and `.env`) at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_mb: u64,
    pub admin_password: Option<String>,
    pub admin_name: String,
    /// Items a single client may post per minute.
    pub item_rate_limit: u64,
    /// Offset used for session anchors and labels.
    pub utc_offset: FixedOffset,
    pub keepalive_secs: u64,
    pub link_previews: bool,
    pub secure_cookies: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: "data/pile.db".to_string(),
            data_dir: PathBuf::from("data"),
            static_dir: PathBuf::from("../frontend/dist"),
            max_upload_mb: 20,
            admin_password: None,
            admin_name: "admin".to_string(),
            item_rate_limit: 30,
            utc_offset: Local::now().offset().fix(),
            keepalive_secs: 20,
            link_previews: true,
            secure_cookies: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();
        AppConfig {
            database_path: var("DATABASE_PATH").unwrap_or(defaults.database_path),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            static_dir: var("STATIC_DIR").map(PathBuf::from).unwrap_or(defaults.static_dir),
            max_upload_mb: parsed("MAX_UPLOAD_MB").unwrap_or(defaults.max_upload_mb),
            admin_password: var("ADMIN_PASSWORD").filter(|p| !p.is_empty()),
            admin_name: var("ADMIN_NAME").unwrap_or(defaults.admin_name),
            item_rate_limit: parsed("ITEM_RATE_LIMIT").unwrap_or(defaults.item_rate_limit),
            utc_offset: parsed("PILE_UTC_OFFSET").unwrap_or(defaults.utc_offset),
            keepalive_secs: parsed("SSE_KEEPALIVE_SECS").unwrap_or(defaults.keepalive_secs),
            link_previews: parsed("LINK_PREVIEWS").unwrap_or(defaults.link_previews),
            secure_cookies: parsed("SECURE_COOKIES").unwrap_or(defaults.secure_cookies),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed setting");
            None
        }
    }
}
