//! Metadata store: one row per known file or folder, keyed by canonical path.
//!
//! Every function takes a generic sqlx executor so callers can pass either
//! the pool or an open transaction (`&mut *tx`).

use std::collections::HashSet;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Folder,
}

impl EntryKind {
    fn table(self) -> &'static str {
        match self {
            EntryKind::File => "files",
            EntryKind::Folder => "folders",
        }
    }
}

/// A row from the `files` or `folders` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub kind: EntryKind,
    pub path: String,
    pub remote_id: Option<String>,
    /// Last known SHA-1 (files only). Empty means unknown.
    pub content_hash: String,
    pub valid: bool,
    pub sequence_id: Option<String>,
    pub parent_id: Option<String>,
}

impl CacheEntry {
    pub fn file(
        path: impl Into<String>,
        remote_id: impl Into<String>,
        content_hash: impl Into<String>,
        sequence_id: Option<String>,
        parent_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntryKind::File,
            path: path.into(),
            remote_id: Some(remote_id.into()),
            content_hash: content_hash.into(),
            valid: true,
            sequence_id,
            parent_id: Some(parent_id.into()),
        }
    }

    pub fn folder(
        path: impl Into<String>,
        remote_id: impl Into<String>,
        sequence_id: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            kind: EntryKind::Folder,
            path: path.into(),
            remote_id: Some(remote_id.into()),
            content_hash: String::new(),
            valid: true,
            sequence_id,
            parent_id,
        }
    }

    fn from_row(kind: EntryKind, row: &SqliteRow) -> Self {
        let content_hash = match kind {
            EntryKind::File => row.get("content_hash"),
            EntryKind::Folder => String::new(),
        };
        Self {
            kind,
            path: row.get("path"),
            remote_id: row.get("remote_id"),
            content_hash,
            valid: row.get("valid"),
            sequence_id: row.get("sequence_id"),
            parent_id: row.get("parent_id"),
        }
    }
}

/// Point lookup by exact (case-sensitive) canonical path.
pub async fn get<'e, E>(db: E, kind: EntryKind, path: &str) -> Result<Option<CacheEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT * FROM {} WHERE path = ?", kind.table());
    let row = sqlx::query(&sql)
        .bind(path)
        .fetch_optional(db)
        .await
        .with_context(|| format!("Failed to look up {path}"))?;

    Ok(row.as_ref().map(|r| CacheEntry::from_row(kind, r)))
}

/// Lookup by remote id. At most one row per kind holds a given id.
pub async fn get_by_remote_id<'e, E>(
    db: E,
    kind: EntryKind,
    remote_id: &str,
) -> Result<Option<CacheEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT * FROM {} WHERE remote_id = ?", kind.table());
    let row = sqlx::query(&sql)
        .bind(remote_id)
        .fetch_optional(db)
        .await
        .with_context(|| format!("Failed to look up remote id {remote_id}"))?;

    Ok(row.as_ref().map(|r| CacheEntry::from_row(kind, r)))
}

/// Insert the entry, or update every mutable column if the path is already known.
pub async fn upsert<'e, E>(db: E, e: &CacheEntry) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = match e.kind {
        EntryKind::File => sqlx::query(
            r#"INSERT INTO files (path, remote_id, content_hash, valid, sequence_id, parent_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                remote_id = excluded.remote_id,
                content_hash = excluded.content_hash,
                valid = excluded.valid,
                sequence_id = excluded.sequence_id,
                parent_id = excluded.parent_id"#,
        )
        .bind(&e.path)
        .bind(&e.remote_id)
        .bind(&e.content_hash),
        EntryKind::Folder => sqlx::query(
            r#"INSERT INTO folders (path, remote_id, valid, sequence_id, parent_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                remote_id = excluded.remote_id,
                valid = excluded.valid,
                sequence_id = excluded.sequence_id,
                parent_id = excluded.parent_id"#,
        )
        .bind(&e.path)
        .bind(&e.remote_id),
    };

    query
        .bind(e.valid)
        .bind(&e.sequence_id)
        .bind(&e.parent_id)
        .execute(db)
        .await
        .with_context(|| format!("Failed to upsert {}", e.path))?;
    Ok(())
}

/// All paths of one kind that the cache believes exist.
pub async fn scan_all_paths<'e, E>(db: E, kind: EntryKind) -> Result<HashSet<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT path FROM {}", kind.table());
    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .fetch_all(db)
        .await
        .with_context(|| format!("Failed to scan {}", kind.table()))?;

    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// Paths of one kind currently marked invalid.
pub async fn scan_stale_paths<'e, E>(db: E, kind: EntryKind) -> Result<HashSet<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT path FROM {} WHERE NOT valid", kind.table());
    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .fetch_all(db)
        .await
        .with_context(|| format!("Failed to scan stale {}", kind.table()))?;

    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// Flip the liveness flag of a row. Returns whether a row was found.
pub async fn set_valid<'e, E>(db: E, kind: EntryKind, path: &str, valid: bool) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("UPDATE {} SET valid = ? WHERE path = ?", kind.table());
    let result = sqlx::query(&sql)
        .bind(valid)
        .bind(path)
        .execute(db)
        .await
        .with_context(|| format!("Failed to mark {path} valid={valid}"))?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete<'e, E>(db: E, kind: EntryKind, path: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {} WHERE path = ?", kind.table());
    let result = sqlx::query(&sql)
        .bind(path)
        .execute(db)
        .await
        .with_context(|| format!("Failed to delete {path}"))?;
    Ok(result.rows_affected() > 0)
}

/// Delete every file and folder row strictly below the folder at `path`.
/// Returns the number of rows removed.
pub async fn delete_below(conn: &mut SqliteConnection, path: &str) -> Result<u64> {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };
    // substr() counts characters, not bytes.
    let prefix_len = prefix.chars().count() as i64;

    let files = sqlx::query("DELETE FROM files WHERE substr(path, 1, ?) = ?")
        .bind(prefix_len)
        .bind(&prefix)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to delete files below {path:?}"))?;

    // One statement, so the foreign key check sees the whole subtree gone.
    let folders = sqlx::query("DELETE FROM folders WHERE path <> ? AND substr(path, 1, ?) = ?")
        .bind(path)
        .bind(prefix_len)
        .bind(&prefix)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to delete folders below {path:?}"))?;

    Ok(files.rows_affected() + folders.rows_affected())
}

/// Drop the row of `kind` that holds `remote_id` under a path other than
/// `path`, with everything cached below it when it is a folder. Returns the
/// old path.
pub async fn evict_moved(
    conn: &mut SqliteConnection,
    kind: EntryKind,
    remote_id: &str,
    path: &str,
) -> Result<Option<String>> {
    let Some(old) = get_by_remote_id(&mut *conn, kind, remote_id).await? else {
        return Ok(None);
    };
    if old.path == path {
        return Ok(None);
    }
    if kind == EntryKind::Folder {
        delete_below(conn, &old.path).await?;
    }
    delete(&mut *conn, kind, &old.path).await?;
    Ok(Some(old.path))
}

/// Make room for the folder at `path` to be stored under `remote_id`.
///
/// A row elsewhere holding that id is evicted. If `path` itself is cached
/// under a different id, its descendants are dropped, since they still
/// point at the old id.
pub async fn rebind_folder(
    conn: &mut SqliteConnection,
    path: &str,
    remote_id: &str,
) -> Result<()> {
    if let Some(old) = evict_moved(conn, EntryKind::Folder, remote_id, path).await? {
        tracing::debug!(from = %old, to = %path, "folder moved remotely, dropped old rows");
    }

    if let Some(current) = get(&mut *conn, EntryKind::Folder, path).await?
        && current.remote_id.as_deref() != Some(remote_id)
    {
        let removed = delete_below(conn, path).await?;
        tracing::debug!(path, removed, "folder replaced remotely, dropped its rows");
    }
    Ok(())
}

/// Row totals for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub total: i64,
    pub stale: i64,
}

pub async fn counts<'e, E>(db: E, kind: EntryKind) -> Result<KindCounts>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN valid THEN 0 ELSE 1 END), 0) FROM {}",
        kind.table()
    );
    let (total, stale): (i64, i64) = sqlx::query_as(&sql)
        .fetch_one(db)
        .await
        .with_context(|| format!("Failed to count {}", kind.table()))?;
    Ok(KindCounts { total, stale })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn root() -> CacheEntry {
        CacheEntry::folder("", "0-root", Some("0".into()), None)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trip() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();
        let file = CacheEntry::file("a.txt", "f1", "aaa", Some("1".into()), "0-root");
        upsert(&pool, &file).await.unwrap();

        let got = get(&pool, EntryKind::File, "a.txt").await.unwrap();
        assert_eq!(got, Some(file));
        assert!(get(&pool, EntryKind::File, "A.txt").await.unwrap().is_none());
        assert!(get(&pool, EntryKind::Folder, "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_updates_existing_row() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();
        upsert(
            &pool,
            &CacheEntry::file("a.txt", "f1", "aaa", Some("1".into()), "0-root"),
        )
        .await
        .unwrap();
        upsert(
            &pool,
            &CacheEntry::file("a.txt", "f1", "bbb", Some("2".into()), "0-root"),
        )
        .await
        .unwrap();

        let got = get(&pool, EntryKind::File, "a.txt").await.unwrap().unwrap();
        assert_eq!(got.content_hash, "bbb");
        assert_eq!(got.sequence_id.as_deref(), Some("2"));
        assert_eq!(counts(&pool, EntryKind::File).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn scan_separates_kinds() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();
        upsert(
            &pool,
            &CacheEntry::folder("docs", "d1", None, Some("0-root".into())),
        )
        .await
        .unwrap();
        upsert(
            &pool,
            &CacheEntry::file("docs/r.txt", "f1", "aaa", None, "d1"),
        )
        .await
        .unwrap();

        let folders = scan_all_paths(&pool, EntryKind::Folder).await.unwrap();
        let files = scan_all_paths(&pool, EntryKind::File).await.unwrap();
        assert_eq!(folders, HashSet::from(["".to_string(), "docs".to_string()]));
        assert_eq!(files, HashSet::from(["docs/r.txt".to_string()]));
    }

    #[tokio::test]
    async fn unknown_parent_is_rejected() {
        let pool = db::init_in_memory().await.unwrap();
        let orphan = CacheEntry::file("x.txt", "f9", "aaa", None, "no-such-folder");
        assert!(upsert(&pool, &orphan).await.is_err());

        let orphan_dir = CacheEntry::folder("d", "d9", None, Some("no-such-folder".into()));
        assert!(upsert(&pool, &orphan_dir).await.is_err());
    }

    #[tokio::test]
    async fn set_valid_marks_stale_rows() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();
        upsert(
            &pool,
            &CacheEntry::file("a.txt", "f1", "aaa", None, "0-root"),
        )
        .await
        .unwrap();

        assert!(set_valid(&pool, EntryKind::File, "a.txt", false).await.unwrap());
        assert!(!set_valid(&pool, EntryKind::File, "missing", false).await.unwrap());

        let c = counts(&pool, EntryKind::File).await.unwrap();
        assert_eq!(c, KindCounts { total: 1, stale: 1 });
        assert_eq!(
            scan_stale_paths(&pool, EntryKind::File).await.unwrap(),
            HashSet::from(["a.txt".to_string()])
        );
        assert!(scan_stale_paths(&pool, EntryKind::Folder).await.unwrap().is_empty());
        let got = get(&pool, EntryKind::File, "a.txt").await.unwrap().unwrap();
        assert!(!got.valid);
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        upsert(
            &mut *tx,
            &CacheEntry::file("a.txt", "f1", "aaa", None, "0-root"),
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert!(get(&pool, EntryKind::File, "a.txt").await.unwrap().is_none());
    }

    async fn seed_tree(pool: &sqlx::SqlitePool) {
        upsert(pool, &root()).await.unwrap();
        for (path, id) in [("docs", "d1"), ("docs2", "d2")] {
            upsert(pool, &CacheEntry::folder(path, id, None, Some("0-root".into())))
                .await
                .unwrap();
        }
        upsert(pool, &CacheEntry::folder("docs/sub", "d3", None, Some("d1".into())))
            .await
            .unwrap();
        upsert(pool, &CacheEntry::file("docs/a.txt", "f1", "", None, "d1"))
            .await
            .unwrap();
        upsert(pool, &CacheEntry::file("docs/sub/b.txt", "f2", "", None, "d3"))
            .await
            .unwrap();
        upsert(pool, &CacheEntry::file("docs2/c.txt", "f3", "", None, "d2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_below_respects_component_boundaries() {
        let pool = db::init_in_memory().await.unwrap();
        seed_tree(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(delete_below(&mut conn, "docs").await.unwrap(), 3);
        drop(conn);

        let folders = scan_all_paths(&pool, EntryKind::Folder).await.unwrap();
        let files = scan_all_paths(&pool, EntryKind::File).await.unwrap();
        assert_eq!(
            folders,
            HashSet::from(["".to_string(), "docs".to_string(), "docs2".to_string()])
        );
        assert_eq!(files, HashSet::from(["docs2/c.txt".to_string()]));
    }

    #[tokio::test]
    async fn moved_file_row_is_evicted() {
        let pool = db::init_in_memory().await.unwrap();
        seed_tree(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        let old = evict_moved(&mut conn, EntryKind::File, "f1", "docs/renamed.txt")
            .await
            .unwrap();
        assert_eq!(old.as_deref(), Some("docs/a.txt"));
        // Same path: nothing to do.
        assert!(evict_moved(&mut conn, EntryKind::File, "f3", "docs2/c.txt")
            .await
            .unwrap()
            .is_none());
        drop(conn);

        assert!(get_by_remote_id(&pool, EntryKind::File, "f1").await.unwrap().is_none());
        upsert(&pool, &CacheEntry::file("docs/renamed.txt", "f1", "", None, "d1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rebind_folder_handles_new_id_and_moved_id() {
        let pool = db::init_in_memory().await.unwrap();
        seed_tree(&pool).await;

        // docs was recreated remotely under a new id.
        let mut conn = pool.acquire().await.unwrap();
        rebind_folder(&mut conn, "docs", "d9").await.unwrap();
        drop(conn);
        upsert(&pool, &CacheEntry::folder("docs", "d9", None, Some("0-root".into())))
            .await
            .unwrap();

        // docs2 was renamed to papers.
        let mut conn = pool.acquire().await.unwrap();
        rebind_folder(&mut conn, "papers", "d2").await.unwrap();
        drop(conn);
        upsert(&pool, &CacheEntry::folder("papers", "d2", None, Some("0-root".into())))
            .await
            .unwrap();

        let folders = scan_all_paths(&pool, EntryKind::Folder).await.unwrap();
        assert_eq!(
            folders,
            HashSet::from(["".to_string(), "docs".to_string(), "papers".to_string()])
        );
        assert!(scan_all_paths(&pool, EntryKind::File).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_drops_rows() {
        let pool = db::init_in_memory().await.unwrap();
        upsert(&pool, &root()).await.unwrap();
        db::reset_schema(&pool).await.unwrap();
        assert!(scan_all_paths(&pool, EntryKind::Folder).await.unwrap().is_empty());
    }
}
