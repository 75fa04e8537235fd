use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use server_api::AdminSuccession;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub admin_succession: AdminSuccession,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/peerchat.db".into(),
            request_timeout_ms: 10_000,
            max_body_bytes: 64 * 1024,
            admin_succession: AdminSuccession::Block,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "request_timeout_ms" => match value.parse() {
                Ok(parsed) => self.request_timeout_ms = parsed,
                Err(_) => warn!(key, value, "config: ignoring non-numeric value"),
            },
            "max_body_bytes" => match value.parse() {
                Ok(parsed) => self.max_body_bytes = parsed,
                Err(_) => warn!(key, value, "config: ignoring non-numeric value"),
            },
            "admin_succession" => match parse_admin_succession(value) {
                Some(policy) => self.admin_succession = policy,
                None => warn!(key, value, "config: unknown admin succession policy"),
            },
            _ => {}
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }

    let overrides = [
        ("SERVER_BIND", "bind_addr"),
        ("APP__BIND_ADDR", "bind_addr"),
        ("DATABASE_URL", "database_url"),
        ("APP__DATABASE_URL", "database_url"),
        ("APP__REQUEST_TIMEOUT_MS", "request_timeout_ms"),
        ("APP__MAX_BODY_BYTES", "max_body_bytes"),
        ("APP__ADMIN_SUCCESSION", "admin_succession"),
    ];
    for (var, key) in overrides {
        if let Ok(value) = std::env::var(var) {
            settings.apply(key, &value);
        }
    }

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => {
            for (key, value) in file_cfg {
                let value = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                settings.apply(&key, &value);
            }
        }
        Err(error) => warn!(%error, "config: server.toml is not valid TOML, using defaults"),
    }
}

fn parse_admin_succession(value: &str) -> Option<AdminSuccession> {
    match value.trim() {
        "block" => Some(AdminSuccession::Block),
        "promote_oldest_member" => Some(AdminSuccession::PromoteOldestMember),
        _ => None,
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_drive_letter(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if has_drive_letter(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    let path = raw_database_url.replace('\\', "/");
    if has_drive_letter(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
