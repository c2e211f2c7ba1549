//! SQLite-based index of cache entries.
//!
//! The index maps each [`CacheKey`] to the blob holding its content along with
//! the metadata needed to manage the cache without reading blob bytes.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::instrument;

use super::{EntryMetadata, OwnerSummary, StoreSize};
use crate::key::{BlobKey, CacheKey, ItemId, Locator, OwnerId};

const ENTRY_COLUMNS: &str =
    "owner_id, item_id, source_locator, blob_key, size_bytes, cached_at, owner_label";

/// SQLite-based index of cache entries.
#[derive(Debug)]
pub struct Index {
    #[debug("<connection>")]
    conn: Connection,
}

impl Index {
    /// Open or create an index database at the given path.
    #[instrument(name = "Index::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            // Runs synchronously at startup.
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create index directory {:?}", parent))?;
        }

        let conn =
            Connection::open(path).with_context(|| format!("open index database at {:?}", path))?;

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    owner_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    source_locator TEXT,
                    blob_key TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    cached_at INTEGER NOT NULL,
                    owner_label TEXT NOT NULL,
                    PRIMARY KEY (owner_id, item_id)
                );

                CREATE INDEX IF NOT EXISTS idx_cache_entries_locator
                ON cache_entries(source_locator);

                CREATE INDEX IF NOT EXISTS idx_cache_entries_cached_at
                ON cache_entries(cached_at);

                CREATE INDEX IF NOT EXISTS idx_cache_entries_blob
                ON cache_entries(blob_key);
                "#,
            )
            .context("initialize database schema")?;

        Ok(())
    }

    /// Insert or replace the entry for its key.
    ///
    /// Returns the blob key of the replaced entry, if there was one.
    #[instrument(name = "Index::upsert", skip(self), fields(key = %entry.key))]
    pub fn upsert(&self, entry: &EntryMetadata) -> Result<Option<BlobKey>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("begin transaction")?;

        let previous = tx
            .query_row(
                "SELECT blob_key FROM cache_entries WHERE owner_id = ?1 AND item_id = ?2",
                params![entry.key.owner.as_str(), entry.key.item.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("read previous entry")?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries
            (owner_id, item_id, source_locator, blob_key, size_bytes, cached_at, owner_label)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.key.owner.as_str(),
                entry.key.item.as_str(),
                entry.source_locator.as_ref().map(Locator::as_str),
                entry.blob_key.to_hex(),
                i64::try_from(entry.size_bytes).context("entry size overflows index")?,
                entry.cached_at.as_millisecond(),
                entry.owner_label,
            ],
        )
        .context("insert entry")?;
        tx.commit().context("commit entry")?;

        previous
            .map(BlobKey::from_hex)
            .transpose()
            .map(|replaced| replaced.filter(|replaced| replaced != &entry.blob_key))
    }

    /// Look up the entry for a key.
    #[instrument(name = "Index::get", skip(self))]
    pub fn get(&self, key: &CacheKey) -> Result<Option<EntryMetadata>> {
        let query =
            format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE owner_id = ?1 AND item_id = ?2");
        self.conn
            .query_row(
                &query,
                params![key.owner.as_str(), key.item.as_str()],
                RawEntry::read,
            )
            .optional()
            .context("query entry by key")?
            .map(EntryMetadata::try_from)
            .transpose()
    }

    /// Look up the most recent entry under `owner` recorded with the given
    /// locator.
    #[instrument(name = "Index::get_by_locator", skip(self))]
    pub fn get_by_locator(
        &self,
        locator: &Locator,
        owner: &OwnerId,
    ) -> Result<Option<EntryMetadata>> {
        let query = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM cache_entries
            WHERE source_locator = ?1 AND owner_id = ?2
            ORDER BY cached_at DESC
            LIMIT 1
            "#
        );
        self.conn
            .query_row(
                &query,
                params![locator.as_str(), owner.as_str()],
                RawEntry::read,
            )
            .optional()
            .context("query entry by locator")?
            .map(EntryMetadata::try_from)
            .transpose()
    }

    /// Check whether an entry exists for the key.
    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE owner_id = ?1 AND item_id = ?2)",
                params![key.owner.as_str(), key.item.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .context("check entry exists")
    }

    /// List the entries under an owner, ordered by item.
    #[instrument(name = "Index::list_owner", skip(self))]
    pub fn list_owner(&self, owner: &OwnerId) -> Result<Vec<EntryMetadata>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE owner_id = ?1 ORDER BY item_id"
        );
        let mut stmt = self.conn.prepare(&query).context("prepare list query")?;
        let rows = stmt
            .query_map(params![owner.as_str()], RawEntry::read)
            .context("execute list query")?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = row.context("read row")?;
            entries.push(EntryMetadata::try_from(raw)?);
        }
        Ok(entries)
    }

    /// Summarize every owner with at least one entry.
    #[instrument(name = "Index::owners", skip(self))]
    pub fn owners(&self) -> Result<Vec<OwnerSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT owner_id, owner_label, COUNT(*), SUM(size_bytes), MIN(cached_at)
                FROM cache_entries
                GROUP BY owner_id
                ORDER BY owner_id
                "#,
            )
            .context("prepare owners query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("execute owners query")?;

        let mut owners = Vec::new();
        for row in rows {
            let (owner, owner_label, count, bytes, oldest) = row.context("read row")?;
            owners.push(OwnerSummary {
                owner: OwnerId::new(owner),
                owner_label,
                count: u64::try_from(count).context("negative entry count")?,
                bytes: u64::try_from(bytes).context("negative entry size")?,
                oldest: Timestamp::from_millisecond(oldest).context("parse oldest timestamp")?,
            });
        }
        Ok(owners)
    }

    /// Owners with at least one entry cached before `cutoff`.
    #[instrument(name = "Index::stale_owners", skip(self))]
    pub fn stale_owners(&self, cutoff: Timestamp) -> Result<Vec<OwnerId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT owner_id FROM cache_entries WHERE cached_at < ?1 ORDER BY owner_id",
            )
            .context("prepare stale owners query")?;
        let rows = stmt
            .query_map(params![cutoff.as_millisecond()], |row| {
                row.get::<_, String>(0)
            })
            .context("execute stale owners query")?;

        let mut owners = Vec::new();
        for row in rows {
            owners.push(OwnerId::new(row.context("read row")?));
        }
        Ok(owners)
    }

    /// Delete every entry under an owner.
    ///
    /// Returns the blob keys the deleted entries referenced.
    #[instrument(name = "Index::delete_owner", skip(self))]
    pub fn delete_owner(&self, owner: &OwnerId) -> Result<Vec<BlobKey>> {
        self.delete_returning(
            "DELETE FROM cache_entries WHERE owner_id = ?1 RETURNING blob_key",
            params![owner.as_str()],
        )
    }

    /// Delete entries under an owner cached before `cutoff`.
    ///
    /// Returns the blob keys the deleted entries referenced.
    #[instrument(name = "Index::delete_older_than", skip(self))]
    pub fn delete_older_than(&self, owner: &OwnerId, cutoff: Timestamp) -> Result<Vec<BlobKey>> {
        self.delete_returning(
            "DELETE FROM cache_entries WHERE owner_id = ?1 AND cached_at < ?2 RETURNING blob_key",
            params![owner.as_str(), cutoff.as_millisecond()],
        )
    }

    /// Delete every entry.
    #[instrument(name = "Index::delete_all", skip(self))]
    pub fn delete_all(&self) -> Result<u64> {
        let deleted = self
            .conn
            .execute("DELETE FROM cache_entries", [])
            .context("delete all entries")?;
        Ok(deleted as u64)
    }

    fn delete_returning(
        &self,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<BlobKey>> {
        let mut stmt = self.conn.prepare(query).context("prepare delete")?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .context("execute delete")?;

        let mut removed = Vec::new();
        for row in rows {
            let hex = row.context("read deleted row")?;
            removed.push(BlobKey::from_hex(hex)?);
        }
        Ok(removed)
    }

    /// Check whether any entry still references the blob.
    pub fn is_referenced(&self, blob: &BlobKey) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE blob_key = ?1)",
                params![blob.to_hex()],
                |row| row.get::<_, bool>(0),
            )
            .context("check blob references")
    }

    /// Count entries and sum their sizes.
    #[instrument(name = "Index::totals", skip(self))]
    pub fn totals(&self) -> Result<StoreSize> {
        let (count, bytes) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("sum entries")?;
        Ok(StoreSize {
            count: u64::try_from(count).context("negative entry count")?,
            bytes: u64::try_from(bytes).context("negative entry size")?,
        })
    }
}

/// An entry row as stored, before parsing into domain types.
struct RawEntry {
    owner: String,
    item: String,
    locator: Option<String>,
    blob_key: String,
    size_bytes: i64,
    cached_at: i64,
    owner_label: String,
}

impl RawEntry {
    /// Read a row selected with [`ENTRY_COLUMNS`].
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner: row.get(0)?,
            item: row.get(1)?,
            locator: row.get(2)?,
            blob_key: row.get(3)?,
            size_bytes: row.get(4)?,
            cached_at: row.get(5)?,
            owner_label: row.get(6)?,
        })
    }
}

impl TryFrom<RawEntry> for EntryMetadata {
    type Error = color_eyre::Report;

    fn try_from(raw: RawEntry) -> Result<Self> {
        Ok(Self {
            key: CacheKey::new(OwnerId::new(raw.owner), ItemId::new(raw.item)),
            source_locator: raw.locator.map(Locator::new),
            blob_key: BlobKey::from_hex(&raw.blob_key)?,
            size_bytes: u64::try_from(raw.size_bytes).context("negative entry size")?,
            cached_at: Timestamp::from_millisecond(raw.cached_at)
                .context("parse cached_at timestamp")?,
            owner_label: raw.owner_label,
        })
    }
}
