//! テスト用の偽の取得手段

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId};

use crate::message_fetcher::{FetchError, MessageSource, Scheduler};
use crate::post::{FirstMessage, ThreadInfo};
use crate::thread_scanner::{ArchivedPage, ThreadSource};

pub fn message(content: &str, timestamp: i64) -> FirstMessage {
    FirstMessage {
        author_id: "u1".to_string(),
        author_name: "A".to_string(),
        content: content.to_string(),
        timestamp,
        attachment_urls: vec![],
    }
}

pub fn thread(id: u64, guild_id: u64, parent_id: u64, name: &str) -> ThreadInfo {
    ThreadInfo {
        id: ChannelId::new(id),
        guild_id: GuildId::new(guild_id),
        parent_id: Some(ChannelId::new(parent_id)),
        name: name.to_string(),
        applied_tags: vec![],
        message_count: None,
        archive_timestamp: None,
    }
}

pub fn archived_thread(id: u64, guild_id: u64, parent_id: u64, archived_at: i64) -> ThreadInfo {
    let mut info = thread(id, guild_id, parent_id, &format!("thread-{}", id));
    info.message_count = Some(3);
    info.archive_timestamp = Utc
        .timestamp_opt(archived_at, 0)
        .single()
        .map(|time| time.to_rfc3339());
    info
}

/// 登録した順に応答を返す
#[derive(Default)]
pub struct FakeMessageSource {
    responses: Mutex<HashMap<u64, VecDeque<Result<FirstMessage, FetchError>>>>,
    calls: Mutex<Vec<(u64, u64)>>,
}

impl FakeMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, thread_id: u64, response: Result<FirstMessage, FetchError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(thread_id)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for FakeMessageSource {
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<FirstMessage, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((channel_id.get(), message_id.get()));
        self.responses
            .lock()
            .unwrap()
            .get_mut(&channel_id.get())
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(FetchError::Http { status: 500 }))
    }
}

/// 待たずに待ち時間だけ記録する
#[derive(Default)]
pub struct RecordingScheduler {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// 終わらない待機
pub struct PendingScheduler;

#[async_trait]
impl Scheduler for PendingScheduler {
    async fn sleep(&self, _duration: Duration) {
        futures::future::pending::<()>().await;
    }
}

/// アクティブ/アーカイブ済みスレッドを返す
#[derive(Default)]
pub struct FakeThreadSource {
    active: Mutex<Vec<ThreadInfo>>,
    archived: Mutex<HashMap<ChannelId, Vec<ThreadInfo>>>,
    archived_requests: Mutex<Vec<(ChannelId, Option<String>, u32)>>,
    failing: Mutex<Vec<ChannelId>>,
}

impl FakeThreadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_active(&self, thread: ThreadInfo) {
        self.active.lock().unwrap().push(thread);
    }

    pub fn add_archived(&self, thread: ThreadInfo) {
        let parent_id = thread.parent_id.expect("parent_id");
        let mut archived = self.archived.lock().unwrap();
        let threads = archived.entry(parent_id).or_default();
        threads.push(thread);
        // 新しい順
        threads.sort_by_key(|thread| std::cmp::Reverse(parse_time(&thread.archive_timestamp)));
    }

    /// この親チャンネルの一覧取得を失敗させる
    pub fn fail_parent(&self, parent_id: u64) {
        self.failing.lock().unwrap().push(ChannelId::new(parent_id));
    }

    pub fn archived_requests(&self) -> Vec<(ChannelId, Option<String>, u32)> {
        self.archived_requests.lock().unwrap().clone()
    }
}

fn parse_time(time: &Option<String>) -> Option<DateTime<chrono::FixedOffset>> {
    time.as_deref()
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
}

#[async_trait]
impl ThreadSource for FakeThreadSource {
    async fn list_active(
        &self,
        guild_id: GuildId,
        parent_id: ChannelId,
    ) -> Result<Vec<ThreadInfo>> {
        if self.failing.lock().unwrap().contains(&parent_id) {
            anyhow::bail!("list_active failed: {}", parent_id);
        }
        Ok(self
            .active
            .lock()
            .unwrap()
            .iter()
            .filter(|thread| thread.guild_id == guild_id && thread.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_archived(
        &self,
        parent_id: ChannelId,
        before: Option<String>,
        limit: u32,
    ) -> Result<ArchivedPage> {
        self.archived_requests
            .lock()
            .unwrap()
            .push((parent_id, before.clone(), limit));
        let before = parse_time(&before);
        let archived = self.archived.lock().unwrap();
        let remaining = archived
            .get(&parent_id)
            .map(|threads| {
                threads
                    .iter()
                    .filter(|thread| match before {
                        Some(before) => parse_time(&thread.archive_timestamp)
                            .map_or(false, |time| time < before),
                        None => true,
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let has_more = remaining.len() > limit as usize;
        Ok(ArchivedPage {
            threads: remaining.into_iter().take(limit as usize).collect(),
            has_more,
        })
    }
}
