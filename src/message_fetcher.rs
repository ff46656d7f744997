use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serenity::async_trait;
use serenity::model::id::{ChannelId, MessageId};
use thiserror::Error;
use tokio::sync::watch;

use crate::post::FirstMessage;

/// 404だった場合に再取得するまでの待ち時間
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// メッセージ取得のエラー
#[derive(Debug, Error, PartialEq)]
pub enum FetchError {
    /// まだメッセージが見えていない (404)
    #[error("メッセージが見つかりません (404)")]
    NotFound,
    /// 404以外のHTTPエラー
    #[error("HTTPエラー: {status}")]
    Http { status: u16 },
    /// 通信エラー
    #[error("通信に失敗: {0}")]
    Transport(String),
    /// レスポンスが読めない
    #[error("レスポンスのパースに失敗: {0}")]
    Decode(String),
    /// 待機中にキャンセルされた
    #[error("取得がキャンセルされました")]
    Cancelled,
}

/// メッセージを取得する手段
///
/// スレッドの最初のメッセージはスレッドチャンネル内にあり、IDはスレッドIDと同じ。
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// チャンネルからメッセージを1件取得する
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<FirstMessage, FetchError>;
}

/// 待機の手段 (テストでは時間を進めずに済ませる)
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// tokioのタイマーで待つ
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 最初のメッセージを取得するクラス
#[derive(Clone)]
pub struct MessageFetcher {
    /// 取得手段
    source: Arc<dyn MessageSource>,
    /// 待機手段
    scheduler: Arc<dyn Scheduler>,
    /// trueになったら待機をやめる
    cancel: watch::Receiver<bool>,
}

impl MessageFetcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        scheduler: Arc<dyn Scheduler>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            scheduler,
            cancel,
        }
    }

    /// スレッドの最初のメッセージを取得する
    ///
    /// 404の場合だけ30秒待って1回だけ再取得する。
    pub async fn fetch_first_message(
        &self,
        thread_id: ChannelId,
    ) -> Result<FirstMessage, FetchError> {
        let message_id = MessageId::new(thread_id.get());
        match self.source.fetch_message(thread_id, message_id).await {
            Err(FetchError::NotFound) => (),
            result => return result,
        }

        warn!(
            "スレッド {} の最初のメッセージが見つからないため{}秒後に再取得します",
            thread_id,
            RETRY_DELAY.as_secs()
        );
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = self.scheduler.sleep(RETRY_DELAY) => (),
            _ = wait_cancelled(&mut cancel) => return Err(FetchError::Cancelled),
        }

        self.source.fetch_message(thread_id, message_id).await
    }
}

/// キャンセルされるまで待つ (送信側が無くなったら永遠に待つ)
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
