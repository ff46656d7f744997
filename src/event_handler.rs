use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::info;
use serenity::model::channel::GuildChannel;
use serenity::model::gateway::Ready;
use tokio::time::{interval, Duration};

use crate::app_config::AppConfig;
use crate::ingestor::Ingestor;
use crate::post::ThreadInfo;

use serenity::async_trait;
use serenity::prelude::*;

/// イベント受信リスナー
pub struct Handler {
    /// 設定
    app_config: AppConfig,
    /// 投稿の記録
    ingestor: Arc<Ingestor>,
    /// 定期処理を開始済みか (再接続でreadyが何度も来る)
    started: AtomicBool,
}

impl Handler {
    /// コンストラクタ
    pub fn new(app_config: AppConfig, ingestor: Arc<Ingestor>) -> Self {
        Self {
            app_config,
            ingestor,
            started: AtomicBool::new(false),
        }
    }

    /// 古い投稿の掃除を定期的に行う
    fn spawn_sweeper(&self) {
        let ingestor = self.ingestor.clone();
        let period = Duration::from_secs(self.app_config.ingest.sweep_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                ingestor.sweep(Utc::now().timestamp()).await;
            }
        });
    }

    /// 過去スレッドのスキャンを裏で行う
    fn spawn_back_scan(&self) {
        let ingestor = self.ingestor.clone();
        tokio::spawn(async move {
            ingestor.run_back_scan().await;
        });
    }
}

/// 作成されたスレッドの情報を取り出す
fn thread_info(thread: &GuildChannel) -> ThreadInfo {
    ThreadInfo {
        id: thread.id,
        guild_id: thread.guild_id,
        parent_id: thread.parent_id,
        name: thread.name.clone(),
        applied_tags: thread.applied_tags.iter().map(|tag| tag.to_string()).collect(),
        // 作成直後は最初のメッセージだけ
        message_count: Some(1),
        archive_timestamp: None,
    }
}

#[async_trait]
impl EventHandler for Handler {
    /// 準備完了時に呼ばれる
    async fn ready(&self, _ctx: Context, data_about_bot: Ready) {
        info!("Bot準備完了: {}", data_about_bot.user.name);

        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_sweeper();
        if self.app_config.ingest.scan_on_ready {
            self.spawn_back_scan();
        }
    }

    /// スレッドが作成された時に呼び出される
    async fn thread_create(&self, _ctx: Context, thread: GuildChannel) {
        // 結果はIngestor側でログ出力済み
        self.ingestor.on_thread_created(&thread_info(&thread)).await;
    }
}
