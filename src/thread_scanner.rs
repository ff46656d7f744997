use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{debug, warn};
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::post::ThreadInfo;

/// アーカイブ済みスレッドを1回に取得する件数
pub const PAGE_SIZE: u32 = 100;

/// アーカイブ済みスレッドの1ページ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchivedPage {
    /// スレッド (アーカイブ時刻の新しい順)
    pub threads: Vec<ThreadInfo>,
    /// 続きがあるか
    pub has_more: bool,
}

/// スレッド一覧を取得する手段
#[async_trait]
pub trait ThreadSource: Send + Sync {
    /// 親チャンネル配下のアクティブなスレッド
    async fn list_active(&self, guild_id: GuildId, parent_id: ChannelId) -> Result<Vec<ThreadInfo>>;

    /// `before` より前にアーカイブされたスレッド
    async fn list_archived(
        &self,
        parent_id: ChannelId,
        before: Option<String>,
        limit: u32,
    ) -> Result<ArchivedPage>;
}

/// フォーラムのスレッドを全部列挙するクラス
#[derive(Clone)]
pub struct ThreadScanner {
    source: Arc<dyn ThreadSource>,
}

impl ThreadScanner {
    pub fn new(source: Arc<dyn ThreadSource>) -> Self {
        Self { source }
    }

    /// アクティブなスレッドとアーカイブ済みスレッドを全部集める
    ///
    /// 重複は取り除かない。
    pub async fn list_all_threads(
        &self,
        guild_id: GuildId,
        parent_id: ChannelId,
    ) -> Result<Vec<ThreadInfo>> {
        let mut threads = self
            .source
            .list_active(guild_id, parent_id)
            .await
            .with_context(|| format!("アクティブなスレッドの取得に失敗: {}", parent_id))?;

        let mut before: Option<String> = None;
        loop {
            let page = self
                .source
                .list_archived(parent_id, before.clone(), PAGE_SIZE)
                .await
                .with_context(|| {
                    format!(
                        "アーカイブ済みスレッドの取得に失敗: {} (before: {:?})",
                        parent_id, before
                    )
                })?;
            if page.threads.is_empty() {
                break;
            }
            debug!(
                "アーカイブ済みスレッドを{}件取得: {} (before: {:?})",
                page.threads.len(),
                parent_id,
                before
            );

            let next = page
                .threads
                .last()
                .and_then(|thread| thread.archive_timestamp.clone());
            let has_more = page.has_more;
            threads.extend(page.threads);
            if !has_more {
                break;
            }

            // 最後のスレッドのアーカイブ時刻を次のカーソルにする
            match next {
                Some(next) if before.as_ref() != Some(&next) => before = Some(next),
                Some(_) => {
                    warn!("カーソルが進まないためページングを中断: {}", parent_id);
                    break;
                }
                None => {
                    warn!(
                        "最後のスレッドにアーカイブ時刻が無いためページングを中断: {}",
                        parent_id
                    );
                    break;
                }
            }
        }

        Ok(threads)
    }
}
