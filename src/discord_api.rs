use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use chrono::DateTime;
use log::warn;
use reqwest::StatusCode;
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId};

use crate::message_fetcher::{FetchError, MessageSource, Scheduler};
use crate::post::{FirstMessage, ThreadInfo};
use crate::thread_scanner::{ArchivedPage, ThreadSource};

/// パース用ユーザー
#[derive(Debug, serde::Deserialize)]
struct RawUser {
    id: String,
    username: String,
}

/// パース用添付ファイル
#[derive(Debug, serde::Deserialize)]
struct RawAttachment {
    url: String,
}

/// パース用メッセージ
#[derive(Debug, serde::Deserialize)]
struct RawMessage {
    author: RawUser,
    #[serde(default)]
    content: String,
    timestamp: String,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
}

/// パース用スレッドメタデータ
#[derive(Debug, serde::Deserialize)]
struct RawThreadMetadata {
    archive_timestamp: Option<String>,
}

/// パース用スレッド
#[derive(Debug, serde::Deserialize)]
struct RawThread {
    id: String,
    guild_id: Option<String>,
    parent_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    applied_tags: Vec<String>,
    message_count: Option<u64>,
    thread_metadata: Option<RawThreadMetadata>,
}

/// パース用スレッド一覧
#[derive(Debug, serde::Deserialize)]
struct RawThreadList {
    threads: Vec<RawThread>,
    #[serde(default)]
    has_more: bool,
}

/// パース用レート制限レスポンス
#[derive(Debug, serde::Deserialize)]
struct RawRateLimit {
    retry_after: f64,
}

/// 429が返ったときに再送する回数
const RATE_LIMIT_RETRIES: u32 = 3;

/// 待ち時間が読み取れなかったときの待ち時間
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Snowflake文字列をパースする
fn parse_snowflake(id: &str) -> Result<u64> {
    let id: u64 = id.parse().with_context(|| format!("IDが数値ではありません: {}", id))?;
    if id == 0 {
        return Err(anyhow!("IDに0は使えません"));
    }
    Ok(id)
}

impl RawMessage {
    fn into_first_message(self) -> Result<FirstMessage, FetchError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|why| FetchError::Decode(format!("timestamp {}: {}", self.timestamp, why)))?
            .timestamp();
        Ok(FirstMessage {
            author_id: self.author.id,
            author_name: self.author.username,
            content: self.content,
            timestamp,
            attachment_urls: self.attachments.into_iter().map(|a| a.url).collect(),
        })
    }
}

impl RawThread {
    fn into_thread_info(self, fallback_guild_id: Option<GuildId>) -> Result<ThreadInfo> {
        let id = ChannelId::new(parse_snowflake(&self.id)?);
        let guild_id = match self.guild_id {
            Some(guild_id) => GuildId::new(parse_snowflake(&guild_id)?),
            None => fallback_guild_id
                .with_context(|| format!("スレッドにギルドIDがありません: {}", id))?,
        };
        let parent_id = match self.parent_id {
            Some(parent_id) => Some(ChannelId::new(parse_snowflake(&parent_id)?)),
            None => None,
        };
        Ok(ThreadInfo {
            id,
            guild_id,
            parent_id,
            name: self.name.unwrap_or_default(),
            applied_tags: self.applied_tags,
            message_count: self.message_count,
            archive_timestamp: self.thread_metadata.and_then(|m| m.archive_timestamp),
        })
    }
}

/// Discord REST APIを直接呼ぶクラス
pub struct DiscordApi {
    /// HTTPクライアント
    client: reqwest::Client,
    /// APIのベースURL
    api_base: String,
    /// Botトークン
    token: String,
    /// レート制限の待機手段
    scheduler: Arc<dyn Scheduler>,
}

impl DiscordApi {
    pub fn new(api_base: &str, token: &str, scheduler: Arc<dyn Scheduler>) -> DiscordApi {
        DiscordApi {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            scheduler,
        }
    }

    /// 認証付きでGETする
    ///
    /// 429が返ったら指定された時間だけ待って再送する。
    /// 再送しきれなかった場合は最後の429をそのまま返す。
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> reqwest::Result<reqwest::Response> {
        let mut retries = 0;
        loop {
            let response = self
                .client
                .get(format!("{}{}", self.api_base, path))
                .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
                .query(query)
                .send()
                .await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS || retries >= RATE_LIMIT_RETRIES {
                return Ok(response);
            }

            retries += 1;
            let wait = retry_after(response).await;
            warn!(
                "レート制限のため{:.2}秒後に再送します: {} ({}/{})",
                wait.as_secs_f64(),
                path,
                retries,
                RATE_LIMIT_RETRIES
            );
            self.scheduler.sleep(wait).await;
        }
    }

    /// スレッド一覧のAPIを呼ぶ
    async fn get_thread_list(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<RawThreadList> {
        let response = self
            .get(path, query)
            .await
            .with_context(|| format!("APIリクエストに失敗: {}", path))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("APIがエラーを返しました: {} ({})", path, status));
        }
        response
            .json::<RawThreadList>()
            .await
            .with_context(|| format!("スレッド一覧のパースに失敗: {}", path))
    }
}

/// 429レスポンスから待ち時間を読み取る
///
/// Retry-Afterヘッダーを優先し、無ければ本文のretry_afterを使う。
async fn retry_after(response: reqwest::Response) -> Duration {
    let header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());
    let seconds = match header {
        Some(seconds) => Some(seconds),
        None => response
            .json::<RawRateLimit>()
            .await
            .ok()
            .map(|limit| limit.retry_after),
    };
    seconds
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[async_trait]
impl MessageSource for DiscordApi {
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<FirstMessage, FetchError> {
        // APIリクエストを実行
        let response = self
            .get(&format!("/channels/{}/messages/{}", channel_id, message_id), &[])
            .await
            .map_err(|why| FetchError::Transport(why.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            status if !status.is_success() => {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                })
            }
            _ => (),
        }
        // メッセージをパース
        response
            .json::<RawMessage>()
            .await
            .map_err(|why| FetchError::Decode(why.to_string()))?
            .into_first_message()
    }
}

#[async_trait]
impl ThreadSource for DiscordApi {
    async fn list_active(
        &self,
        guild_id: GuildId,
        parent_id: ChannelId,
    ) -> Result<Vec<ThreadInfo>> {
        // アクティブなスレッドはギルド単位でしか取れないので親チャンネルで絞る
        let list = self
            .get_thread_list(&format!("/guilds/{}/threads/active", guild_id), &[])
            .await?;
        list.threads
            .into_iter()
            .map(|thread| thread.into_thread_info(Some(guild_id)))
            .filter(|thread| match thread {
                Ok(thread) => thread.parent_id == Some(parent_id),
                Err(_) => true,
            })
            .collect()
    }

    async fn list_archived(
        &self,
        parent_id: ChannelId,
        before: Option<String>,
        limit: u32,
    ) -> Result<ArchivedPage> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before));
        }
        let list = self
            .get_thread_list(
                &format!("/channels/{}/threads/archived/public", parent_id),
                &query,
            )
            .await?;
        let threads = list
            .threads
            .into_iter()
            .map(|thread| thread.into_thread_info(None))
            .collect::<Result<Vec<_>>>()?;
        Ok(ArchivedPage {
            threads,
            has_more: list.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const MESSAGE_JSON: &str = r#"{
        "author": { "id": "u1", "username": "A" },
        "content": "hello",
        "timestamp": "1970-01-01T00:16:40.000000+00:00"
    }"#;

    /// HTTPレスポンスを組み立てる
    fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut text = format!("HTTP/1.1 {}\r\n", status);
        text.push_str("Content-Type: application/json\r\n");
        text.push_str(&format!("Content-Length: {}\r\n", body.len()));
        text.push_str("Connection: close\r\n");
        for (name, value) in headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");
        text.push_str(body);
        text
    }

    /// 決まったレスポンスを順に返すサーバー (最後のものを繰り返す)
    async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let response = responses
                    .get(n)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or_default();
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = socket.read(&mut chunk).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..read]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    #[tokio::test]
    async fn rate_limited_request_waits_retry_after_and_resends() {
        let (base, hits) = serve(vec![
            http_response("429 Too Many Requests", &[("Retry-After", "1.5")], "{}"),
            http_response("200 OK", &[], MESSAGE_JSON),
        ])
        .await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let api = DiscordApi::new(&base, "token", scheduler.clone());

        let message = api
            .fetch_message(ChannelId::new(42), MessageId::new(42))
            .await
            .unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.sleeps(), vec![Duration::from_millis(1500)]);
    }

    #[tokio::test]
    async fn persistent_rate_limit_gives_up_with_429() {
        let (base, hits) = serve(vec![http_response(
            "429 Too Many Requests",
            &[("Retry-After", "2")],
            "{}",
        )])
        .await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let api = DiscordApi::new(&base, "token", scheduler.clone());

        let result = api
            .fetch_message(ChannelId::new(42), MessageId::new(42))
            .await;
        assert_eq!(result, Err(FetchError::Http { status: 429 }));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.sleeps(), vec![Duration::from_secs(2); 3]);
    }

    #[tokio::test]
    async fn rate_limit_body_is_used_without_header() {
        let (base, hits) = serve(vec![
            http_response(
                "429 Too Many Requests",
                &[],
                r#"{"retry_after": 0.25, "global": false}"#,
            ),
            http_response("200 OK", &[], r#"{"threads": [], "has_more": false}"#),
        ])
        .await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let api = DiscordApi::new(&base, "token", scheduler.clone());

        let page = api
            .list_archived(ChannelId::new(5), None, 100)
            .await
            .unwrap();
        assert!(page.threads.is_empty());
        assert!(!page.has_more);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.sleeps(), vec![Duration::from_millis(250)]);
    }

    #[test]
    fn message_json_becomes_first_message() {
        let raw: RawMessage = serde_json::from_str(
            r#"{
                "id": "42",
                "author": { "id": "u1", "username": "A", "bot": false },
                "content": "hello",
                "timestamp": "1970-01-01T00:16:40.000000+00:00",
                "attachments": [
                    { "id": "1", "url": "https://cdn.example/a.png" },
                    { "id": "2", "url": "https://cdn.example/b.png" }
                ]
            }"#,
        )
        .unwrap();
        let message = raw.into_first_message().unwrap();
        assert_eq!(message.author_id, "u1");
        assert_eq!(message.author_name, "A");
        assert_eq!(message.content, "hello");
        assert_eq!(message.timestamp, 1000);
        assert_eq!(message.attachment_urls.len(), 2);
    }

    #[test]
    fn bad_timestamp_is_decode_error() {
        let raw: RawMessage = serde_json::from_str(
            r#"{ "author": { "id": "u1", "username": "A" }, "timestamp": "yesterday" }"#,
        )
        .unwrap();
        assert!(matches!(raw.into_first_message(), Err(FetchError::Decode(_))));
    }

    #[test]
    fn thread_list_json_becomes_threads() {
        let list: RawThreadList = serde_json::from_str(
            r#"{
                "threads": [{
                    "id": "42",
                    "guild_id": "9",
                    "parent_id": "111122223333",
                    "name": "Hi",
                    "applied_tags": ["7", "8"],
                    "message_count": 12,
                    "thread_metadata": {
                        "archived": true,
                        "archive_timestamp": "2024-01-01T00:00:00.000000+00:00"
                    }
                }],
                "members": [],
                "has_more": true
            }"#,
        )
        .unwrap();
        assert!(list.has_more);
        let thread = list
            .threads
            .into_iter()
            .next()
            .unwrap()
            .into_thread_info(None)
            .unwrap();
        assert_eq!(thread.id, ChannelId::new(42));
        assert_eq!(thread.guild_id, GuildId::new(9));
        assert_eq!(thread.parent_id, Some(ChannelId::new(111122223333)));
        assert_eq!(thread.applied_tags, vec!["7", "8"]);
        assert_eq!(thread.message_count, Some(12));
        assert_eq!(
            thread.archive_timestamp.as_deref(),
            Some("2024-01-01T00:00:00.000000+00:00")
        );
    }

    #[test]
    fn thread_without_guild_uses_fallback() {
        let raw: RawThread = serde_json::from_str(r#"{ "id": "42", "parent_id": "5" }"#).unwrap();
        let thread = raw.into_thread_info(Some(GuildId::new(9))).unwrap();
        assert_eq!(thread.guild_id, GuildId::new(9));

        let raw: RawThread = serde_json::from_str(r#"{ "id": "42" }"#).unwrap();
        assert!(raw.into_thread_info(None).is_err());
    }
}
