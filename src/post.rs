use serenity::model::id::{ChannelId, GuildId};

/// 新規スレッド取り込み時の本文の上限 (バイト)
pub const LIVE_CONTENT_CAP: usize = 512;
/// 過去スレッドスキャン時の本文の上限 (バイト)
pub const SCAN_CONTENT_CAP: usize = 300;

/// スレッドの情報
///
/// 新規作成イベントとスレッド一覧のどちらからも作られる。
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    /// スレッドID (最初のメッセージIDと同じ)
    pub id: ChannelId,
    /// ギルドID
    pub guild_id: GuildId,
    /// 親チャンネルID
    pub parent_id: Option<ChannelId>,
    /// スレッド名
    pub name: String,
    /// 付けられているタグのID
    pub applied_tags: Vec<String>,
    /// Discordが返すメッセージ数
    pub message_count: Option<u64>,
    /// アーカイブされた時刻 (RFC 3339)
    pub archive_timestamp: Option<String>,
}

/// スレッドの最初のメッセージ
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FirstMessage {
    /// 投稿者のID
    pub author_id: String,
    /// 投稿者の名前
    pub author_name: String,
    /// 本文
    pub content: String,
    /// 作成時刻 (UNIX秒)
    pub timestamp: i64,
    /// 添付ファイルのURL
    pub attachment_urls: Vec<String>,
}

/// 投稿の要約
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Post {
    /// スレッドID
    pub id: String,
    /// スレッド名
    pub title: String,
    /// 投稿者の名前
    #[serde(rename = "author")]
    pub author_name: String,
    /// 投稿者のID
    pub author_id: String,
    /// 最初のメッセージの本文 (上限で切り詰め済み)
    pub content: String,
    /// タグID (カンマ区切り)
    pub tags: String,
    /// メッセージ数 (JSONには保存しない)
    #[serde(skip, default = "default_message_count")]
    pub message_count: u64,
    /// 作成時刻 (UNIX秒)
    pub timestamp: i64,
    /// 最初の添付ファイルのURL
    pub cover_image_url: String,
}

fn default_message_count() -> u64 {
    1
}

impl Post {
    /// スレッドと最初のメッセージから投稿を作る
    pub fn normalize(thread: &ThreadInfo, message: &FirstMessage, content_cap: usize) -> Post {
        Post {
            id: thread.id.to_string(),
            title: thread.name.clone(),
            author_name: message.author_name.clone(),
            author_id: message.author_id.clone(),
            content: truncate_bytes(&message.content, content_cap).to_string(),
            tags: thread.applied_tags.join(","),
            message_count: thread.message_count.unwrap_or(1),
            timestamp: message.timestamp,
            cover_image_url: message.attachment_urls.first().cloned().unwrap_or_default(),
        }
    }
}

/// バイト数で切り詰める (文字の途中では切らない)
pub fn truncate_bytes(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
