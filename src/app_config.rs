use std::path::PathBuf;

use anyhow::{Context as _, Result};
use config::Config;

/// Discordの設定
#[derive(Debug, serde::Deserialize, PartialEq, Clone)]
pub struct DiscordConfig {
    /// REST APIのベースURL
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
        }
    }
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

/// 保存先の設定
#[derive(Debug, serde::Deserialize, PartialEq, Clone)]
pub struct StorageConfig {
    /// データを保存するルートディレクトリ
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// タスク設定ファイルのパス (省略時は root_dir/task_config.json)
    #[serde(default)]
    pub task_config: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            task_config: None,
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("data")
}

impl StorageConfig {
    /// タスク設定ファイルのパス
    pub fn task_config_path(&self) -> PathBuf {
        self.task_config
            .clone()
            .unwrap_or_else(|| self.root_dir.join("task_config.json"))
    }
}

/// 取り込み処理の設定
#[derive(Debug, serde::Deserialize, PartialEq, Clone)]
pub struct IngestConfig {
    /// 古い投稿を掃除する間隔 (秒)
    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,
    /// 起動時に過去スレッドのスキャンを行うか
    #[serde(default)]
    pub scan_on_ready: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sweep_interval_sec: default_sweep_interval_sec(),
            scan_on_ready: false,
        }
    }
}

fn default_sweep_interval_sec() -> u64 {
    3600
}

/// アプリケーションの設定
#[derive(Debug, Default, serde::Deserialize, PartialEq, Clone)]
pub struct AppConfig {
    /// Discordの設定
    #[serde(default)]
    pub discord: DiscordConfig,
    /// 保存先の設定
    #[serde(default)]
    pub storage: StorageConfig,
    /// 取り込み処理の設定
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load_config() -> Result<AppConfig> {
        // 設定ファイルを読み込む
        let config = Config::builder()
            .add_source(config::File::with_name("bot/config.toml").required(false))
            // Eg.. `APP_STORAGE__ROOT_DIR=/var/lib/bot ./target/app`
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .context("設定ファイルの読み込みに失敗")?;
        // 設定ファイルをパース
        let app_config = config
            .try_deserialize::<AppConfig>()
            .context("設定ファイルのパースに失敗")?;
        Ok(app_config)
    }
}
