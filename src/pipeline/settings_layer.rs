use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SETTINGS_PATH: &str = "config/coordinator.settings.toml";
const DEFAULT_BIND: &str = "127.0.0.1:8788";
const DEFAULT_STATE_DIR: &str = "var/coordinator";
const DEFAULT_CATALOG_PATH: &str = "config/stage_catalog.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub bind: SocketAddr,
    pub state_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub launch_endpoint: Option<Url>,
    pub alert_webhook_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsOverlay {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub catalog_path: Option<String>,
    #[serde(default)]
    pub launch_endpoint: Option<String>,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read coordinator settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse coordinator settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("coordinator setting '{field}' is invalid: {message}")]
    InvalidField { field: String, message: String },
}

pub fn load_settings_file(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<SettingsOverlay, SettingsError> {
    let path = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) });
    match path {
        Some(path) => read_overlay(path.as_path()),
        None => {
            let default_path = app_root.join(DEFAULT_SETTINGS_PATH);
            if default_path.exists() {
                read_overlay(default_path.as_path())
            } else {
                Ok(SettingsOverlay::default())
            }
        }
    }
}

fn read_overlay(path: &Path) -> Result<SettingsOverlay, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|e| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_settings_toml(raw.as_str(), path)
}

pub fn parse_settings_toml(raw: &str, path: &Path) -> Result<SettingsOverlay, SettingsError> {
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SettingsFile {
        #[serde(default)]
        coordinator: SettingsOverlay,
    }

    toml::from_str::<SettingsFile>(raw)
        .map(|file| file.coordinator)
        .map_err(|e| SettingsError::ParseToml {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

pub fn overlay_from_env() -> SettingsOverlay {
    SettingsOverlay {
        bind: std::env::var("NOWCAST_COORDINATOR_BIND").ok(),
        state_dir: std::env::var("NOWCAST_STATE_DIR").ok(),
        catalog_path: std::env::var("NOWCAST_CATALOG").ok(),
        launch_endpoint: std::env::var("NOWCAST_LAUNCH_ENDPOINT").ok(),
        alert_webhook_url: std::env::var("NOWCAST_ALERT_WEBHOOK_URL").ok(),
    }
}

pub fn resolve_settings(
    file: &SettingsOverlay,
    env: &SettingsOverlay,
    app_root: &Path,
) -> Result<CoordinatorSettings, SettingsError> {
    let bind_raw = choose(env.bind.as_deref(), file.bind.as_deref()).unwrap_or(DEFAULT_BIND);
    let bind = bind_raw
        .parse::<SocketAddr>()
        .map_err(|e| invalid("bind", format!("'{bind_raw}': {e}")))?;

    let state_dir = absolutize(
        choose(env.state_dir.as_deref(), file.state_dir.as_deref()).unwrap_or(DEFAULT_STATE_DIR),
        app_root,
    );
    let catalog_path = absolutize(
        choose(env.catalog_path.as_deref(), file.catalog_path.as_deref())
            .unwrap_or(DEFAULT_CATALOG_PATH),
        app_root,
    );
    let launch_endpoint = choose(env.launch_endpoint.as_deref(), file.launch_endpoint.as_deref())
        .map(|raw| parse_url("launch_endpoint", raw))
        .transpose()?;
    let alert_webhook_url = choose(
        env.alert_webhook_url.as_deref(),
        file.alert_webhook_url.as_deref(),
    )
    .map(|raw| parse_url("alert_webhook_url", raw))
    .transpose()?;

    Ok(CoordinatorSettings {
        bind,
        state_dir,
        catalog_path,
        launch_endpoint,
        alert_webhook_url,
    })
}

pub fn load_coordinator_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<CoordinatorSettings, SettingsError> {
    let file = load_settings_file(app_root, explicit_path)?;
    resolve_settings(&file, &overlay_from_env(), app_root)
}

fn choose<'a>(primary: Option<&'a str>, fallback: Option<&'a str>) -> Option<&'a str> {
    primary
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| fallback.map(str::trim).filter(|v| !v.is_empty()))
}

fn absolutize(raw: &str, app_root: &Path) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        app_root.join(candidate)
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, SettingsError> {
    let url = Url::parse(raw).map_err(|e| invalid(field, format!("'{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(field, format!("'{raw}' must use http or https")));
    }
    Ok(url)
}

fn invalid(field: &str, message: String) -> SettingsError {
    SettingsError::InvalidField {
        field: field.to_string(),
        message,
    }
}
