use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serenity::model::id::{ChannelId, GuildId};
use thiserror::Error;

/// タスク設定の読み込みエラー
#[derive(Debug, Error)]
pub enum TaskConfigError {
    /// ファイルが読めない
    #[error("タスク設定ファイルの読み込みに失敗: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// JSONの構造が不正
    #[error("タスク設定ファイルのパースに失敗: {0}")]
    Parse(String),
}

/// JSON上のID (文字列でも数値でも書ける)
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn to_u64(&self) -> Result<u64, TaskConfigError> {
        let id = match self {
            RawId::Number(id) => *id,
            RawId::Text(text) => text.trim().parse().map_err(|_| {
                TaskConfigError::Parse(format!("IDが数値ではありません: {:?}", text))
            })?,
        };
        if id == 0 {
            return Err(TaskConfigError::Parse("IDに0は使えません".to_string()));
        }
        Ok(id)
    }
}

/// パース用チャンネル設定
#[derive(Debug, serde::Deserialize)]
struct RawChannel {
    channel_id: RawId,
    #[serde(default)]
    thread_id: Vec<RawId>,
}

/// パース用ギルド設定
#[derive(Debug, serde::Deserialize)]
struct RawGuild {
    #[serde(default)]
    name: String,
    #[allow(dead_code)]
    #[serde(default)]
    guilds_id: Option<RawId>,
    #[serde(default)]
    data: BTreeMap<String, RawChannel>,
}

/// 監視対象のフォーラムチャンネル
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// 親チャンネルID
    pub parent_channel_id: ChannelId,
    /// テーブル名に使う短い名前
    pub key: String,
    /// 取り込み済みのスレッドID
    pub known_thread_ids: HashSet<ChannelId>,
}

/// ギルドごとの設定
#[derive(Debug, Clone, PartialEq)]
pub struct GuildConfig {
    /// ギルドID
    pub guild_id: GuildId,
    /// ギルド名
    pub name: String,
    /// キー → チャンネル設定
    pub channels: BTreeMap<String, ChannelSpec>,
}

/// タスク設定 (task_config.json)
///
/// 呼び出しのたびに読み直す前提で、長期間保持しない。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskConfig {
    guilds: BTreeMap<GuildId, GuildConfig>,
}

impl TaskConfig {
    /// ファイルから読み込む
    pub fn load(path: &Path) -> Result<TaskConfig, TaskConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| TaskConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// JSON文字列をパースする
    pub fn parse(text: &str) -> Result<TaskConfig, TaskConfigError> {
        let raw: BTreeMap<String, RawGuild> =
            serde_json::from_str(text).map_err(|why| TaskConfigError::Parse(why.to_string()))?;

        let mut guilds = BTreeMap::new();
        for (guild_key, raw_guild) in raw {
            let guild_id = GuildId::new(RawId::Text(guild_key).to_u64()?);
            let mut channels = BTreeMap::new();
            for (key, raw_channel) in raw_guild.data {
                let parent_channel_id = ChannelId::new(raw_channel.channel_id.to_u64()?);
                let known_thread_ids = raw_channel
                    .thread_id
                    .iter()
                    .map(|id| id.to_u64().map(ChannelId::new))
                    .collect::<Result<HashSet<_>, _>>()?;
                channels.insert(
                    key.clone(),
                    ChannelSpec {
                        parent_channel_id,
                        key,
                        known_thread_ids,
                    },
                );
            }
            guilds.insert(
                guild_id,
                GuildConfig {
                    guild_id,
                    name: raw_guild.name,
                    channels,
                },
            );
        }
        Ok(TaskConfig { guilds })
    }

    /// 親チャンネルが監視対象かどうか
    pub fn is_monitored(&self, parent_channel_id: ChannelId) -> bool {
        self.iterate()
            .any(|(_, _, spec)| spec.parent_channel_id == parent_channel_id)
    }

    /// (ギルドID, キー, チャンネル設定) を列挙する
    pub fn iterate(&self) -> impl Iterator<Item = (GuildId, &str, &ChannelSpec)> + '_ {
        self.guilds.values().flat_map(|guild| {
            guild
                .channels
                .iter()
                .map(move |(key, spec)| (guild.guild_id, key.as_str(), spec))
        })
    }

    /// ギルド設定を列挙する
    pub fn guilds(&self) -> impl Iterator<Item = &GuildConfig> + '_ {
        self.guilds.values()
    }
}
