//! Configuration loader and validator for the auction catalog mirror.
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::layout::LayoutNames;
use crate::retry::RetryPolicy;
use crate::sheet::NormalizeRules;
use crate::stage::StagingOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    pub source: Source,
    #[serde(default)]
    pub drive: Drive,
    #[serde(default)]
    pub staging: Staging,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub schedule: Schedule,
}

/// Serving-layer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub sync_on_startup: bool,
    #[serde(default)]
    pub sync_on_catalog_request: bool,
}

/// External spreadsheet settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub sheet_url: String,
    #[serde(default = "default_header_keywords")]
    pub header_keywords: Vec<String>,
    #[serde(default = "default_section_markers")]
    pub section_markers: Vec<String>,
    #[serde(default = "default_media_column")]
    pub media_column: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Remote store credentials and layout names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Drive {
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
    #[serde(default = "default_scratch_folder")]
    pub scratch_folder: String,
    #[serde(default = "default_published_folder")]
    pub published_folder: String,
    #[serde(default = "default_staged_csv")]
    pub staged_csv: String,
    #[serde(default = "default_baseline_csv")]
    pub baseline_csv: String,
    #[serde(default = "default_published_csv")]
    pub published_csv: String,
}

/// Staging pipeline bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Staging {
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_images")]
    pub max_images_per_record: usize,
    #[serde(default)]
    pub max_records: Option<usize>,
}

/// Retry policy applied to remote-store calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
}

/// Daily sync trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wall-clock time, `HH:MM`.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

fn default_true() -> bool {
    true
}
fn default_bind() -> String {
    "0.0.0.0:5000".into()
}
fn default_header_keywords() -> Vec<String> {
    vec!["VEHICLE DETAILS".into(), "LOCATION".into(), "DRIVE LINK".into()]
}
fn default_section_markers() -> Vec<String> {
    vec!["ONLINE AUCTION CLOSING".into()]
}
fn default_media_column() -> String {
    "DRIVE LINK".into()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_token_path() -> String {
    "token.json".into()
}
fn default_root_folder() -> String {
    "Revive Auctions".into()
}
fn default_scratch_folder() -> String {
    "Buffer".into()
}
fn default_published_folder() -> String {
    "Images".into()
}
fn default_staged_csv() -> String {
    "buffer.csv".into()
}
fn default_baseline_csv() -> String {
    "source.csv".into()
}
fn default_published_csv() -> String {
    "data.csv".into()
}
fn default_concurrency() -> usize {
    5
}
fn default_max_images() -> usize {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 2000]
}
fn default_daily_at() -> String {
    "00:00".into()
}
fn default_utc_offset_minutes() -> i32 {
    240
}

impl Default for App {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            sync_on_startup: true,
            sync_on_catalog_request: false,
        }
    }
}

impl Default for Drive {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
            timeout_secs: default_timeout_secs(),
            root_folder: default_root_folder(),
            scratch_folder: default_scratch_folder(),
            published_folder: default_published_folder(),
            staged_csv: default_staged_csv(),
            baseline_csv: default_baseline_csv(),
            published_csv: default_published_csv(),
        }
    }
}

impl Default for Staging {
    fn default() -> Self {
        Self {
            parallel: true,
            concurrency: default_concurrency(),
            max_images_per_record: default_max_images(),
            max_records: None,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_at: default_daily_at(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

impl Config {
    pub fn layout_names(&self) -> LayoutNames {
        LayoutNames {
            root: self.drive.root_folder.clone(),
            scratch: self.drive.scratch_folder.clone(),
            published: self.drive.published_folder.clone(),
            staged_csv: self.drive.staged_csv.clone(),
            baseline_csv: self.drive.baseline_csv.clone(),
            published_csv: self.drive.published_csv.clone(),
        }
    }

    pub fn normalize_rules(&self) -> NormalizeRules {
        NormalizeRules {
            header_keywords: self.source.header_keywords.clone(),
            section_markers: self.source.section_markers.clone(),
            media_column: self.source.media_column.clone(),
        }
    }

    pub fn staging_options(&self) -> StagingOptions {
        StagingOptions {
            parallel: self.staging.parallel,
            concurrency: self.staging.concurrency,
            max_images_per_record: self.staging.max_images_per_record,
            max_records: self.staging.max_records,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry
                .backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn token_path(&self) -> PathBuf {
        PathBuf::from(&self.drive.token_path)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn drive_timeout(&self) -> Duration {
        Duration::from_secs(self.drive.timeout_secs)
    }

    /// Bind address; `validate` guarantees it parses.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.app
            .bind
            .parse()
            .map_err(|_| ConfigError::Invalid("app.bind must be a socket address"))
    }

    pub fn daily_at(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.schedule.daily_at.trim(), "%H:%M")
            .map_err(|_| ConfigError::Invalid("schedule.daily_at must be HH:MM"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `SHEET_URL` in the environment overrides `source.sheet_url`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(url) = std::env::var("SHEET_URL") {
        if !url.trim().is_empty() {
            cfg.source.sheet_url = url;
        }
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    cfg.bind_addr()?;

    if cfg.source.sheet_url.trim().is_empty() {
        return Err(ConfigError::Invalid("source.sheet_url must be non-empty"));
    }
    if cfg.source.header_keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "source.header_keywords must contain a keyword",
        ));
    }
    if cfg.source.media_column.trim().is_empty() {
        return Err(ConfigError::Invalid("source.media_column must be non-empty"));
    }
    if cfg.source.timeout_secs == 0 {
        return Err(ConfigError::Invalid("source.timeout_secs must be > 0"));
    }

    let d = &cfg.drive;
    if d.token_path.trim().is_empty() {
        return Err(ConfigError::Invalid("drive.token_path must be non-empty"));
    }
    if d.timeout_secs == 0 {
        return Err(ConfigError::Invalid("drive.timeout_secs must be > 0"));
    }
    if d.root_folder.trim().is_empty()
        || d.scratch_folder.trim().is_empty()
        || d.published_folder.trim().is_empty()
    {
        return Err(ConfigError::Invalid("drive folder names must be non-empty"));
    }
    if d.scratch_folder == d.published_folder {
        return Err(ConfigError::Invalid(
            "drive.scratch_folder and drive.published_folder must differ",
        ));
    }
    let csvs = [&d.staged_csv, &d.baseline_csv, &d.published_csv];
    if csvs.iter().any(|n| n.trim().is_empty()) {
        return Err(ConfigError::Invalid("drive csv names must be non-empty"));
    }
    if d.staged_csv == d.baseline_csv
        || d.staged_csv == d.published_csv
        || d.baseline_csv == d.published_csv
    {
        return Err(ConfigError::Invalid("drive csv names must be distinct"));
    }

    if cfg.staging.concurrency == 0 {
        return Err(ConfigError::Invalid("staging.concurrency must be > 0"));
    }
    if cfg.staging.max_images_per_record == 0 {
        return Err(ConfigError::Invalid(
            "staging.max_images_per_record must be > 0",
        ));
    }
    if cfg.staging.max_records == Some(0) {
        return Err(ConfigError::Invalid("staging.max_records must be > 0 when set"));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }

    cfg.daily_at()?;
    if cfg.schedule.utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::Invalid(
            "schedule.utc_offset_minutes must be within one day",
        ));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  bind: "0.0.0.0:5000"
  sync_on_startup: true
  sync_on_catalog_request: false

source:
  sheet_url: "https://docs.google.com/spreadsheets/d/SHEET_DOCUMENT_ID/edit#gid=0"
  header_keywords:
    - "VEHICLE DETAILS"
    - "LOCATION"
    - "DRIVE LINK"
  section_markers:
    - "ONLINE AUCTION CLOSING"
  media_column: "DRIVE LINK"
  timeout_secs: 10

drive:
  token_path: "token.json"
  timeout_secs: 10
  root_folder: "Revive Auctions"
  scratch_folder: "Buffer"
  published_folder: "Images"
  staged_csv: "buffer.csv"
  baseline_csv: "source.csv"
  published_csv: "data.csv"

staging:
  parallel: true
  concurrency: 5
  max_images_per_record: 5

retry:
  max_attempts: 3
  backoff_ms: [1000, 2000]

schedule:
  enabled: true
  daily_at: "00:00"
  utc_offset_minutes: 240
"#
}
