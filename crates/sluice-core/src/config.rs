//! 設定（TOML から読み込み）
//!
//! 全オプションにデフォルトがあるので、空ファイル（またはファイルなし）も有効な設定
//! オプション名は snake_case、大文字表記（`NUM_WORKERS`, `GRACEFUL_TIMEOUT` など）も別名として受け付ける

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// パス指定がないときに参照する環境変数
pub const CONFIG_ENV: &str = "SLUICE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub foreman: ForemanConfig,
    pub database: DatabaseConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default = "default_num_workers", alias = "NUM_WORKERS")]
    pub num_workers: usize,
    #[serde(default = "default_graceful_timeout", alias = "GRACEFUL_TIMEOUT")]
    pub graceful_timeout_secs: u64,
    /// キューに積まず呼び出し側でその場で実行する
    #[serde(default, alias = "TASK_ALWAYS_EAGER")]
    pub task_always_eager: bool,
    /// 0 で統計を完全に無効化
    #[serde(default = "default_stats_retention", alias = "STATS_RETENTION_MINUTES")]
    pub stats_retention_minutes: u64,
    #[serde(default = "default_task_qs_limit", alias = "TASK_QS_LIMIT")]
    pub task_qs_limit: usize,
    /// 停止要求に従う前にバックログを全部さばく
    #[serde(default, alias = "WORKAHOLIC")]
    pub workaholic: bool,
    /// 空文字列で pid ファイルを無効化
    #[serde(default = "default_pid_file", alias = "PID_FILE")]
    pub pid_file: PathBuf,
    #[serde(default = "default_wakeup_calls_dir", alias = "WAKEUP_CALLS_DIR")]
    pub wakeup_calls_dir: PathBuf,
}

fn default_num_workers() -> usize { 4 }
fn default_graceful_timeout() -> u64 { 10 }
fn default_stats_retention() -> u64 { 7 * 24 * 60 }
fn default_task_qs_limit() -> usize { 100 }
fn default_pid_file() -> PathBuf { PathBuf::from("/tmp/sluice/foreman.pid") }
fn default_wakeup_calls_dir() -> PathBuf { PathBuf::from("/tmp/sluice.wakeup") }

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            graceful_timeout_secs: default_graceful_timeout(),
            task_always_eager: false,
            stats_retention_minutes: default_stats_retention(),
            task_qs_limit: default_task_qs_limit(),
            workaholic: false,
            pid_file: default_pid_file(),
            wakeup_calls_dir: default_wakeup_calls_dir(),
        }
    }
}

impl ForemanConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn pid_file(&self) -> Option<&Path> {
        (!self.pid_file.as_os_str().is_empty()).then_some(self.pid_file.as_path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_task_db", alias = "TASK_DB")]
    pub task_db: PathBuf,
    #[serde(default = "default_event_db", alias = "EVENT_DB")]
    pub event_db: PathBuf,
    /// 0 でランタイムガードを無効化
    #[serde(default = "default_query_timeout", alias = "QUERY_TIMEOUT_MS")]
    pub query_timeout_ms: u64,
}

fn default_task_db() -> PathBuf { PathBuf::from("/tmp/sluice/tasks.sqlite3") }
fn default_event_db() -> PathBuf { PathBuf::from("/tmp/sluice/events.sqlite3") }
fn default_query_timeout() -> u64 { 5_000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            task_db: default_task_db(),
            event_db: default_event_db(),
            query_timeout_ms: default_query_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_age_base", alias = "AGE_BASE")]
    pub age_base: u32,
    /// 削除時の DELETE 文 1 回あたりの行数
    #[serde(default = "default_batch_size", alias = "BATCH_SIZE")]
    pub batch_size: usize,
    #[serde(default = "default_epoch_seconds", alias = "EPOCH_SECONDS")]
    pub epoch_seconds: i64,
}

fn default_age_base() -> u32 { 2 }
fn default_batch_size() -> usize { 500 }
fn default_epoch_seconds() -> i64 { 3600 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            age_base: default_age_base(),
            batch_size: default_batch_size(),
            epoch_seconds: default_epoch_seconds(),
        }
    }
}

impl SluiceConfig {
    /// `path` から、なければ `$SLUICE_CONFIG` から、それもなければデフォルト
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) if !path.is_empty() => Self::load_from(Path::new(&path)),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.foreman.num_workers >= 1, "foreman.num_workers must be at least 1"),
            (self.foreman.task_qs_limit >= 1, "foreman.task_qs_limit must be at least 1"),
            (self.retention.age_base >= 2, "retention.age_base must be at least 2"),
            (self.retention.batch_size >= 1, "retention.batch_size must be at least 1"),
            (self.retention.epoch_seconds >= 1, "retention.epoch_seconds must be at least 1"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }
}
