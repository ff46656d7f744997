mod app_config;
mod discord_api;
mod event_handler;
mod ingestor;
mod message_fetcher;
mod post;
mod post_db;
mod rolling_store;
mod task_config;
mod thread_scanner;

#[cfg(test)]
mod test_support;

use std::env;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{error, info};
use serenity::prelude::*;
use tokio::sync::watch;

use crate::app_config::AppConfig;
use crate::discord_api::DiscordApi;
use crate::event_handler::Handler;
use crate::ingestor::Ingestor;
use crate::message_fetcher::{MessageFetcher, TokioScheduler};
use crate::thread_scanner::ThreadScanner;

#[tokio::main]
async fn main() -> Result<()> {
    // ログの設定を読み込む
    log4rs::init_file("bot/log4rs.yml", Default::default()).context("ログ設定の読み込みに失敗")?;

    // 設定を読み込む
    let app_config = AppConfig::load_config()?;
    let token = env::var("DISCORD_TOKEN").context("環境変数 DISCORD_TOKEN が設定されていません")?;

    // 終了時に再取得の待機を打ち切る
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let scheduler = Arc::new(TokioScheduler);
    let api = Arc::new(DiscordApi::new(
        &app_config.discord.api_base,
        &token,
        scheduler.clone(),
    ));
    let fetcher = MessageFetcher::new(api.clone(), scheduler, cancel_rx);
    let ingestor = Arc::new(Ingestor::new(
        &app_config.storage.root_dir,
        &app_config.storage.task_config_path(),
        fetcher,
        ThreadScanner::new(api),
    ));
    let handler = Handler::new(app_config, ingestor);

    // スレッドの作成イベントだけ受け取れればよい
    let intents = GatewayIntents::GUILDS;
    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .context("クライアントの作成に失敗")?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(why) = tokio::signal::ctrl_c().await {
            error!("終了シグナルの待機に失敗: {:?}", why);
            return;
        }
        info!("終了します");
        let _ = cancel_tx.send(true);
        shard_manager.shutdown_all().await;
    });

    // start listening for events by starting a single shard
    client
        .start()
        .await
        .context("クライアントの実行中にエラーが発生")?;
    Ok(())
}
