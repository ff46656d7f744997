use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use log::{error, info, warn};
use serenity::model::id::GuildId;

use crate::message_fetcher::MessageFetcher;
use crate::post::{Post, ThreadInfo, LIVE_CONTENT_CAP, SCAN_CONTENT_CAP};
use crate::post_db::PostDb;
use crate::rolling_store::{RollingStore, SweepReport};
use crate::task_config::{ChannelSpec, GuildConfig, TaskConfig};
use crate::thread_scanner::ThreadScanner;

/// 新規スレッドの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 監視対象外のチャンネル
    Unmonitored,
    /// 保存した
    Recorded,
    /// 失敗した (ログ出力済み)
    Failed,
}

/// 過去スレッドスキャンの結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// 列挙したスレッドの数 (重複は除く)
    pub listed: usize,
    /// タスク設定で取り込み済みだったスレッドの数
    pub skipped_known: usize,
    /// データベースに登録済みだったスレッドの数
    pub skipped_stored: usize,
    /// 登録したスレッドの数
    pub inserted: usize,
    /// 失敗したスレッド/チャンネル/ギルドの数
    pub failed: usize,
}

/// フォーラムの投稿を記録するクラス
pub struct Ingestor {
    /// データを保存するルートディレクトリ
    root_dir: PathBuf,
    /// タスク設定ファイルのパス
    task_config_path: PathBuf,
    /// 直近7日分の投稿
    store: RollingStore,
    /// 最初のメッセージの取得
    fetcher: MessageFetcher,
    /// スレッドの列挙
    scanner: ThreadScanner,
}

impl Ingestor {
    pub fn new(
        root_dir: &Path,
        task_config_path: &Path,
        fetcher: MessageFetcher,
        scanner: ThreadScanner,
    ) -> Ingestor {
        Ingestor {
            root_dir: root_dir.to_path_buf(),
            task_config_path: task_config_path.to_path_buf(),
            store: RollingStore::new(root_dir),
            fetcher,
            scanner,
        }
    }

    /// 直近7日分の投稿の保存先
    #[cfg(test)]
    pub fn store(&self) -> &RollingStore {
        &self.store
    }

    /// タスク設定を読み直す
    fn load_task_config(&self) -> Result<TaskConfig> {
        TaskConfig::load(&self.task_config_path).context("タスク設定の読み込みに失敗")
    }

    /// スレッドが作成された時に呼ばれる
    pub async fn on_thread_created(&self, thread: &ThreadInfo) -> IngestOutcome {
        let task_config = match self.load_task_config() {
            Ok(task_config) => task_config,
            Err(why) => {
                error!("新規スレッドの処理を中断: {:?}", why);
                return IngestOutcome::Failed;
            }
        };

        // 設定で指定された親チャンネルのスレッドのみ処理する
        let parent_id = match thread.parent_id {
            Some(parent_id) if task_config.is_monitored(parent_id) => parent_id,
            _ => return IngestOutcome::Unmonitored,
        };

        let message = match self.fetcher.fetch_first_message(thread.id).await {
            Ok(message) => message,
            Err(why) => {
                error!("スレッド {} の最初のメッセージの取得に失敗: {}", thread.id, why);
                return IngestOutcome::Failed;
            }
        };

        let post = Post::normalize(thread, &message, LIVE_CONTENT_CAP);
        if let Err(why) = self.store.append(thread.guild_id, parent_id, post).await {
            error!("新規スレッドの保存に失敗: {:?}", why);
            return IngestOutcome::Failed;
        }
        info!(
            "新規スレッドを記録: {} ({}) in {}",
            thread.name, thread.id, parent_id
        );
        IngestOutcome::Recorded
    }

    /// 古い投稿を掃除する
    pub async fn sweep(&self, now: i64) -> SweepReport {
        self.store.sweep(now).await
    }

    /// 設定された全チャンネルの過去スレッドをデータベースに取り込む
    pub async fn run_back_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let task_config = match self.load_task_config() {
            Ok(task_config) => task_config,
            Err(why) => {
                error!("過去スレッドのスキャンを中断: {:?}", why);
                return report;
            }
        };

        for guild in task_config.guilds() {
            if let Err(why) = self.scan_guild(guild, &mut report).await {
                report.failed += 1;
                error!("ギルド {} のスキャンに失敗: {:?}", guild.guild_id, why);
            }
        }

        info!(
            "過去スレッドのスキャン完了: 列挙{}件 登録{}件 設定済み{}件 登録済み{}件 失敗{}件",
            report.listed,
            report.inserted,
            report.skipped_known,
            report.skipped_stored,
            report.failed
        );
        report
    }

    /// 1ギルド分をスキャンする
    async fn scan_guild(&self, guild: &GuildConfig, report: &mut ScanReport) -> Result<()> {
        info!("ギルド {} ({}) のスキャンを開始", guild.name, guild.guild_id);
        let db = PostDb::open(&PostDb::path_for(&self.root_dir, guild.guild_id))?;

        for (key, spec) in &guild.channels {
            if let Err(why) = self.scan_channel(&db, guild.guild_id, key, spec, report).await {
                report.failed += 1;
                error!(
                    "チャンネル {} ({}) のスキャンに失敗: {:?}",
                    key, spec.parent_channel_id, why
                );
            }
        }

        db.close()
    }

    /// 1チャンネル分をスキャンする
    async fn scan_channel(
        &self,
        db: &PostDb,
        guild_id: GuildId,
        key: &str,
        spec: &ChannelSpec,
        report: &mut ScanReport,
    ) -> Result<()> {
        let table = PostDb::table_name(key, spec.parent_channel_id);
        let threads = self
            .scanner
            .list_all_threads(guild_id, spec.parent_channel_id)
            .await?;

        // アクティブとアーカイブ済みで同じスレッドが出ることがある
        let mut seen = HashSet::new();
        for thread in threads.iter().filter(|thread| seen.insert(thread.id)) {
            report.listed += 1;
            if spec.known_thread_ids.contains(&thread.id) {
                report.skipped_known += 1;
                continue;
            }
            match db.contains(&table, &thread.id.to_string()).await {
                Ok(true) => {
                    report.skipped_stored += 1;
                    continue;
                }
                Ok(false) => (),
                Err(why) => {
                    report.failed += 1;
                    error!("{:?}", why);
                    continue;
                }
            }

            let message = match self.fetcher.fetch_first_message(thread.id).await {
                Ok(message) => message,
                Err(why) => {
                    report.failed += 1;
                    warn!("スレッド {} の最初のメッセージの取得に失敗: {}", thread.id, why);
                    continue;
                }
            };

            let post = Post::normalize(thread, &message, SCAN_CONTENT_CAP);
            match db.insert(&post, &table).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.skipped_stored += 1,
                Err(why) => {
                    report.failed += 1;
                    error!("{:?}", why);
                }
            }
        }
        Ok(())
    }
}
