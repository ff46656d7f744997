use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use futures::lock::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serenity::model::id::{ChannelId, GuildId};

use crate::post::Post;
use crate::rolling_store::create_dir;

/// 接続と作成済みテーブル
struct PostDbInner {
    /// sql接続情報
    conn: Connection,
    /// このハンドルで作成を確認したテーブル
    tables: HashSet<String>,
}

/// ギルドごとの投稿データベース
///
/// 過去スレッドのスキャン1回分だけ使い、終わったら閉じる。
pub struct PostDb {
    inner: Mutex<PostDbInner>,
}

impl PostDb {
    /// ギルドのデータベースファイルのパス
    pub fn path_for(root: &Path, guild_id: GuildId) -> PathBuf {
        root.join(format!("{}.db", guild_id))
    }

    /// テーブル名 (<key>_<チャンネルIDの下4桁>)
    pub fn table_name(key: &str, channel_id: ChannelId) -> String {
        let channel_id = channel_id.to_string();
        let last4 = &channel_id[channel_id.len().saturating_sub(4)..];
        format!("{}_{}", key, last4)
    }

    /// データベースを開く (無ければ作る)
    pub fn open(path: &Path) -> Result<PostDb> {
        if let Some(dir) = path.parent() {
            create_dir(dir).with_context(|| {
                format!("データベースのディレクトリ作成に失敗: {}", dir.display())
            })?;
        }
        // データベースに接続
        let conn = Connection::open(path)
            .with_context(|| format!("投稿データベースのオープンに失敗: {}", path.display()))?;

        Ok(PostDb {
            inner: Mutex::new(PostDbInner {
                conn,
                tables: HashSet::new(),
            }),
        })
    }

    // テーブルが無ければ作成する
    fn ensure_table(inner: &mut PostDbInner, table: &str) -> Result<()> {
        if inner.tables.contains(table) {
            return Ok(());
        }
        inner
            .conn
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id               TEXT    PRIMARY KEY,
                        title            TEXT    NOT NULL,
                        author           TEXT    NOT NULL,
                        author_id        TEXT    NOT NULL,
                        content          TEXT    NOT NULL,
                        tags             TEXT    NOT NULL,
                        message_count    INTEGER NOT NULL,
                        timestamp        INTEGER NOT NULL,
                        cover_image_url  TEXT    NOT NULL
                    )",
                    quote(table)
                ),
                params!(),
            )
            .with_context(|| format!("投稿テーブルの作成に失敗: {}", table))?;
        inner.tables.insert(table.to_string());
        Ok(())
    }

    // テーブルが存在するか
    fn table_exists(inner: &PostDbInner, table: &str) -> Result<bool> {
        if inner.tables.contains(table) {
            return Ok(true);
        }
        let found = inner
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params!(table),
                |_| Ok(()),
            )
            .optional()
            .with_context(|| format!("テーブルの確認に失敗: {}", table))?;
        Ok(found.is_some())
    }

    /// 投稿を登録する (同じIDがあれば何もしない)
    ///
    /// 新しく登録されたらtrueを返す。
    pub async fn insert(&self, post: &Post, table: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Self::ensure_table(&mut inner, table)?;

        // データベースに書き込み
        let changed = inner
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (
                        id,
                        title,
                        author,
                        author_id,
                        content,
                        tags,
                        message_count,
                        timestamp,
                        cover_image_url
                    )
                    VALUES
                        (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    quote(table)
                ),
                params!(
                    post.id,
                    post.title,
                    post.author_name,
                    post.author_id,
                    post.content,
                    post.tags,
                    post.message_count as i64,
                    post.timestamp,
                    post.cover_image_url,
                ),
            )
            .with_context(|| {
                format!("投稿データベースへの書き込みに失敗: {} ({})", table, post.id)
            })?;

        Ok(changed > 0)
    }

    /// 投稿が登録済みかどうか
    pub async fn contains(&self, table: &str, post_id: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        if !Self::table_exists(&inner, table)? {
            return Ok(false);
        }
        let found = inner
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", quote(table)),
                params!(post_id),
                |_| Ok(()),
            )
            .optional()
            .with_context(|| format!("投稿の確認に失敗: {} ({})", table, post_id))?;
        Ok(found.is_some())
    }

    /// テーブルの投稿を全部読み込む (タイムスタンプ順)
    #[cfg(test)]
    pub async fn posts(&self, table: &str) -> Result<Vec<Post>> {
        let inner = self.inner.lock().await;
        if !Self::table_exists(&inner, table)? {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT
                id,
                title,
                author,
                author_id,
                content,
                tags,
                message_count,
                timestamp,
                cover_image_url
            FROM
                {}
            ORDER BY
                timestamp, id",
            quote(table)
        );
        // クエリを構築
        let mut stmt = inner
            .conn
            .prepare(&query)
            .with_context(|| format!("投稿読み込み用のSQL文の構築に失敗: {}", query))?;
        let posts = stmt
            .query_map(params!(), |row| {
                let message_count: i64 = row.get(6)?;
                Ok(Post {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author_name: row.get(2)?,
                    author_id: row.get(3)?,
                    content: row.get(4)?,
                    tags: row.get(5)?,
                    message_count: message_count.max(0) as u64,
                    timestamp: row.get(7)?,
                    cover_image_url: row.get(8)?,
                })
            })
            .context("投稿データベースの読み込みに失敗")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("投稿データベースの読み込みに失敗")?;
        Ok(posts)
    }

    /// データベースを閉じる
    pub fn close(self) -> Result<()> {
        self.inner
            .into_inner()
            .conn
            .close()
            .map_err(|(_, why)| why)
            .context("投稿データベースのクローズに失敗")
    }
}

/// テーブル名をSQL用にクォートする
fn quote(table: &str) -> String {
    format!("\"{}\"", table.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str, timestamp: i64) -> Post {
        Post {
            id: id.to_string(),
            title: "title".to_string(),
            author_name: "A".to_string(),
            author_id: "u1".to_string(),
            content: "hello".to_string(),
            tags: "1,2".to_string(),
            message_count: 4,
            timestamp,
            cover_image_url: "https://cdn.example/a.png".to_string(),
        }
    }

    #[test]
    fn table_name_uses_last_four_digits() {
        assert_eq!(
            PostDb::table_name("art", ChannelId::new(111122223333)),
            "art_3333"
        );
        assert_eq!(PostDb::table_name("x", ChannelId::new(42)), "x_42");
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let db = PostDb::open(&PostDb::path_for(root.path(), GuildId::new(9))).unwrap();

        assert!(db.insert(&post("42", 1000), "art_3333").await.unwrap());
        assert!(!db.insert(&post("42", 2000), "art_3333").await.unwrap());

        let posts = db.posts("art_3333").await.unwrap();
        assert_eq!(posts, vec![post("42", 1000)]);
    }

    #[tokio::test]
    async fn tables_are_created_on_first_insert() {
        let root = tempfile::tempdir().unwrap();
        let db = PostDb::open(&root.path().join("9.db")).unwrap();

        assert!(!db.contains("art_3333", "42").await.unwrap());
        assert!(db.posts("art_3333").await.unwrap().is_empty());

        db.insert(&post("42", 1000), "art_3333").await.unwrap();
        db.insert(&post("42", 1000), "news_7777").await.unwrap();
        assert!(db.contains("art_3333", "42").await.unwrap());
        assert!(db.contains("news_7777", "42").await.unwrap());
        assert!(!db.contains("art_3333", "43").await.unwrap());
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let root = tempfile::tempdir().unwrap();
        let path = PostDb::path_for(root.path(), GuildId::new(9));
        {
            let db = PostDb::open(&path).unwrap();
            db.insert(&post("2", 200), "art_3333").await.unwrap();
            db.insert(&post("1", 100), "art_3333").await.unwrap();
            db.close().unwrap();
        }

        let db = PostDb::open(&path).unwrap();
        let ids = db
            .posts("art_3333")
            .await
            .unwrap()
            .into_iter()
            .map(|post| post.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(db.contains("art_3333", "2").await.unwrap());
    }
}
