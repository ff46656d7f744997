use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::lock::Mutex;
use log::{debug, error, info, warn};
use serenity::model::id::{ChannelId, GuildId};

use crate::post::Post;

/// 投稿を保持する秒数 (7日)
pub const RETENTION_SECS: i64 = 7 * 86400;

/// チャンネルID → 投稿 (到着順)
pub type RollingBucket = BTreeMap<String, Vec<Post>>;

/// 掃除の結果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// 見たファイルの数
    pub files_scanned: usize,
    /// 書き直したファイルの数
    pub files_rewritten: usize,
    /// 削除したファイルの数
    pub files_deleted: usize,
    /// 処理に失敗したファイルの数
    pub files_failed: usize,
    /// 取り除いた投稿ID
    pub removed_ids: Vec<String>,
}

/// 1ファイル分の掃除結果
enum FileSweep {
    Untouched,
    Rewritten(Vec<String>),
    Deleted(Vec<String>),
}

/// 直近7日分の投稿をギルドごとのJSONに保存するクラス
pub struct RollingStore {
    /// 保存先ディレクトリ (<root>/new_post)
    dir: PathBuf,
    /// ファイルごとのロック
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RollingStore {
    pub fn new(root: &Path) -> RollingStore {
        RollingStore {
            dir: root.join("new_post"),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// ギルドのファイルパス
    pub fn file_path(&self, guild_id: GuildId) -> PathBuf {
        self.dir.join(format!("{}.json", guild_id))
    }

    /// ファイルに対応するロックを取得する
    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 投稿を末尾に追加する
    pub async fn append(&self, guild_id: GuildId, channel_id: ChannelId, post: Post) -> Result<()> {
        let path = self.file_path(guild_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        create_dir(&self.dir)
            .with_context(|| format!("保存先ディレクトリの作成に失敗: {}", self.dir.display()))?;

        // 壊れていたら空から作り直す
        let mut bucket = match read_bucket(&path)? {
            Some(Ok(bucket)) => bucket,
            Some(Err(why)) => {
                warn!("壊れたファイルを初期化します: {} ({})", path.display(), why);
                RollingBucket::new()
            }
            None => RollingBucket::new(),
        };

        let post_id = post.id.clone();
        bucket.entry(channel_id.to_string()).or_default().push(post);
        write_bucket(&path, &bucket)
            .with_context(|| format!("投稿の書き込みに失敗: {} ({})", path.display(), post_id))?;
        debug!("投稿を追加: {} → {}", post_id, path.display());
        Ok(())
    }

    /// ギルドのファイルを読み込む (無ければ空)
    #[cfg(test)]
    pub async fn load(&self, guild_id: GuildId) -> Result<RollingBucket> {
        let path = self.file_path(guild_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        match read_bucket(&path)? {
            Some(bucket) => {
                bucket.with_context(|| format!("ファイルのパースに失敗: {}", path.display()))
            }
            None => Ok(RollingBucket::new()),
        }
    }

    /// 7日より古い投稿と重複した投稿を取り除く
    ///
    /// 全チャンネルが空になったファイルは削除する。1ファイルの失敗で全体は止めない。
    pub async fn sweep(&self, now: i64) -> SweepReport {
        let threshold = now - RETENTION_SECS;
        let mut report = SweepReport::default();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(why) if why.kind() == ErrorKind::NotFound => return report,
            Err(why) => {
                error!("保存先ディレクトリの読み込みに失敗: {} ({})", self.dir.display(), why);
                return report;
            }
        };

        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        for path in paths {
            report.files_scanned += 1;
            let lock = self.lock_for(&path);
            let _guard = lock.lock().await;

            match sweep_file(&path, threshold) {
                Ok(FileSweep::Untouched) => (),
                Ok(FileSweep::Rewritten(removed)) => {
                    report.files_rewritten += 1;
                    report.removed_ids.extend(removed);
                }
                Ok(FileSweep::Deleted(removed)) => {
                    report.files_deleted += 1;
                    report.removed_ids.extend(removed);
                }
                Err(why) => {
                    report.files_failed += 1;
                    error!("古い投稿の掃除に失敗: {:?}", why);
                }
            }
        }

        info!(
            "古い投稿を掃除: {}件削除 (ファイル {}件中 書き直し{}件 削除{}件 失敗{}件)",
            report.removed_ids.len(),
            report.files_scanned,
            report.files_rewritten,
            report.files_deleted,
            report.files_failed
        );
        report
    }
}

/// 1ファイルを掃除する
fn sweep_file(path: &Path, threshold: i64) -> Result<FileSweep> {
    let mut bucket = match read_bucket(path)? {
        Some(bucket) => {
            bucket.with_context(|| format!("ファイルのパースに失敗: {}", path.display()))?
        }
        // 別の処理で消された
        None => return Ok(FileSweep::Untouched),
    };

    let mut removed = Vec::new();
    for posts in bucket.values_mut() {
        let mut seen = HashSet::new();
        posts.retain(|post| {
            let keep = post.timestamp >= threshold && seen.insert(post.id.clone());
            if !keep {
                removed.push(post.id.clone());
            }
            keep
        });
    }

    if bucket.values().all(|posts| posts.is_empty()) {
        fs::remove_file(path).with_context(|| format!("ファイルの削除に失敗: {}", path.display()))?;
        return Ok(FileSweep::Deleted(removed));
    }
    if removed.is_empty() {
        return Ok(FileSweep::Untouched);
    }

    bucket.retain(|_, posts| !posts.is_empty());
    write_bucket(path, &bucket)
        .with_context(|| format!("ファイルの書き直しに失敗: {}", path.display()))?;
    Ok(FileSweep::Rewritten(removed))
}

/// ファイルを読み込む
///
/// 無ければNone、JSONが壊れていれば内側のErrを返す。
fn read_bucket(path: &Path) -> Result<Option<Result<RollingBucket>>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(why) if why.kind() == ErrorKind::NotFound => return Ok(None),
        Err(why) => {
            return Err(why).with_context(|| format!("ファイルの読み込みに失敗: {}", path.display()))
        }
    };
    Ok(Some(serde_json::from_str(&text).map_err(Into::into)))
}

/// 一時ファイルに書いてから置き換える
fn write_bucket(path: &Path, bucket: &RollingBucket) -> Result<()> {
    let json = serde_json::to_string_pretty(bucket)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = open_for_write(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
pub(crate) fn create_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_for_write(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn open_for_write(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
