use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use audio_stream_types::{StoredBlock, TrackRecord};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};

use crate::codec::{decode_planar, deobfuscate, encode_planar, obfuscate};
use crate::config::StoreConfig;
use crate::error::StoreError;

const SCHEMA_VERSION: i32 = 1;

/// Handle to the block cache. Cheap to clone.
#[derive(Clone)]
pub struct ChunkStore {
    pool: Pool<SqliteConnectionManager>,
    config: Arc<StoreConfig>,
}

/// Tracks removed by one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed because `last_accessed_at_ms` was older than the max age.
    pub expired: Vec<String>,
    /// Removed oldest-first to get under the total-size budget.
    pub over_budget: Vec<String>,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.over_budget.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tracks: u64,
    pub blocks: u64,
    pub payload_bytes: u64,
}

impl ChunkStore {
    /// Open (or create) the database, retrying transient failures.
    ///
    /// Each attempt is bounded by `open_timeout`; between attempts the configured delays
    /// apply. Eviction runs once the store is up; an eviction failure is logged, not returned.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let config = Arc::new(config);
        let pool = retry_open(&config, |attempt| {
            let config = config.clone();
            async move {
                tracing::debug!(attempt, path = %config.path.display(), "opening chunk store");
                tokio::task::spawn_blocking(move || open_pool(&config))
                    .await
                    .map_err(|err| StoreError::Worker(err.to_string()))?
            }
        })
        .await?;

        let store = Self { pool, config };
        if store.config.evict_on_open {
            match store.evict().await {
                Ok(report) if !report.is_empty() => tracing::info!(
                    expired = report.expired.len(),
                    over_budget = report.over_budget.len(),
                    bytes_freed = report.bytes_freed,
                    "evicted cached tracks"
                ),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "eviction at open failed"),
            }
        }
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Insert or update a track record. Existing blocks are kept.
    pub async fn put_track(&self, record: &TrackRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run("put_track", move |conn| {
            conn.execute(
                r#"
                INSERT INTO tracks (
                    track_id, display_name, duration_seconds, sample_rate, channel_count,
                    total_block_count, source_url, file_size_bytes, last_accessed_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(track_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    duration_seconds = excluded.duration_seconds,
                    sample_rate = excluded.sample_rate,
                    channel_count = excluded.channel_count,
                    total_block_count = excluded.total_block_count,
                    source_url = excluded.source_url,
                    file_size_bytes = excluded.file_size_bytes,
                    last_accessed_at_ms = excluded.last_accessed_at_ms
                "#,
                params![
                    record.track_id,
                    obfuscate(&record.display_name),
                    record.duration_seconds,
                    record.sample_rate as i64,
                    record.channel_count as i64,
                    record.total_block_count as i64,
                    obfuscate(&record.source_url),
                    record.file_size_bytes as i64,
                    record.last_accessed_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_track(&self, track_id: &str) -> Result<Option<TrackRecord>, StoreError> {
        let track_id = track_id.to_string();
        self.run("get_track", move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE track_id = ?1"),
                    params![track_id],
                    RawTrack::from_row,
                )
                .optional()?;
            row.map(RawTrack::into_record).transpose()
        })
        .await
    }

    /// Most recently used first.
    pub async fn list_tracks(&self) -> Result<Vec<TrackRecord>, StoreError> {
        self.run("list_tracks", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRACK_COLUMNS} FROM tracks ORDER BY last_accessed_at_ms DESC, track_id"
            ))?;
            let rows = stmt
                .query_map([], RawTrack::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawTrack::into_record).collect()
        })
        .await
    }

    /// Refresh `last_accessed_at_ms`. Returns `false` if the track is unknown.
    pub async fn touch_track(&self, track_id: &str) -> Result<bool, StoreError> {
        self.touch_track_at(track_id, now_ms()).await
    }

    pub async fn touch_track_at(&self, track_id: &str, at_ms: i64) -> Result<bool, StoreError> {
        let track_id = track_id.to_string();
        self.run("touch_track", move |conn| {
            let changed = conn.execute(
                "UPDATE tracks SET last_accessed_at_ms = ?2 WHERE track_id = ?1",
                params![track_id, at_ms],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Persist one block. Blocks are immutable: a second write for the same index is
    /// ignored and reported as `false`. The owning track must already exist.
    pub async fn put_block(&self, block: &StoredBlock) -> Result<bool, StoreError> {
        let channels = block.channel_count();
        if channels == 0 {
            return Err(StoreError::InvalidBlock("no channels".to_string()));
        }
        if let Some(bad) = block
            .channel_payloads
            .iter()
            .position(|ch| ch.len() as u64 != block.sample_count)
        {
            return Err(StoreError::InvalidBlock(format!(
                "channel {bad} length differs from sample_count {}",
                block.sample_count
            )));
        }

        let payload = encode_planar(&block.channel_payloads);
        let track_id = block.track_id.clone();
        let index = block.block_index;
        let sample_rate = block.sample_rate;
        let sample_count = block.sample_count;
        self.run("put_block", move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT INTO blocks (
                    track_id, block_index, sample_rate, sample_count, channel_count,
                    payload_bytes, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(track_id, block_index) DO NOTHING
                "#,
                params![
                    track_id,
                    index as i64,
                    sample_rate as i64,
                    sample_count as i64,
                    channels as i64,
                    payload.len() as i64,
                    payload,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get_block(
        &self,
        track_id: &str,
        index: u32,
    ) -> Result<Option<StoredBlock>, StoreError> {
        let track_id = track_id.to_string();
        self.run("get_block", move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT sample_rate, sample_count, channel_count, payload
                    FROM blocks WHERE track_id = ?1 AND block_index = ?2
                    "#,
                    params![track_id, index as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((sample_rate, sample_count, channels, payload)) = row else {
                return Ok(None);
            };
            let channel_payloads =
                decode_planar(&payload, channels as usize, sample_count as usize)?;
            Ok(Some(StoredBlock {
                track_id,
                block_index: index,
                sample_rate: sample_rate as u32,
                sample_count: sample_count as u64,
                channel_payloads,
            }))
        })
        .await
    }

    /// Stored block indices for a track, ascending.
    pub async fn list_block_indices(&self, track_id: &str) -> Result<Vec<u32>, StoreError> {
        let track_id = track_id.to_string();
        self.run("list_block_indices", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT block_index FROM blocks WHERE track_id = ?1 ORDER BY block_index",
            )?;
            let indices = stmt
                .query_map(params![track_id], |row| row.get::<_, i64>(0))?
                .map(|r| r.map(|i| i as u32))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(indices)
        })
        .await
    }

    /// Remove a track and all of its blocks. Returns `false` if nothing was stored.
    pub async fn delete_track(&self, track_id: &str) -> Result<bool, StoreError> {
        let track_id = track_id.to_string();
        self.run("delete_track", move |conn| {
            let tx = conn.transaction()?;
            let blocks = tx.execute("DELETE FROM blocks WHERE track_id = ?1", params![track_id])?;
            let tracks = tx.execute("DELETE FROM tracks WHERE track_id = ?1", params![track_id])?;
            tx.commit()?;
            Ok(blocks + tracks > 0)
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.run("stats", |conn| {
            let tracks: i64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
            let (blocks, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(payload_bytes), 0) FROM blocks",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(StoreStats {
                tracks: tracks as u64,
                blocks: blocks as u64,
                payload_bytes: bytes as u64,
            })
        })
        .await
    }

    /// Age- then size-based eviction against the wall clock.
    pub async fn evict(&self) -> Result<EvictionReport, StoreError> {
        self.evict_at(now_ms()).await
    }

    /// Eviction with an explicit "now" in milliseconds since the Unix epoch.
    pub async fn evict_at(&self, now_ms: i64) -> Result<EvictionReport, StoreError> {
        let max_age_ms = i64::try_from(self.config.max_age.as_millis()).unwrap_or(i64::MAX);
        let max_total = self.config.max_total_bytes;
        self.run("evict", move |conn| {
            evict_tracks(conn, now_ms, max_age_ms, max_total)
        })
        .await
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let after = self.config.op_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        });
        match tokio::time::timeout(after, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StoreError::Worker(join.to_string())),
            Err(_) => {
                tracing::warn!(op, ?after, "chunk store operation timed out");
                Err(StoreError::Timeout { op, after })
            }
        }
    }
}

/// Drive `attempt` up to `open_attempts` times, each under `open_timeout`.
async fn retry_open<T, F, Fut>(config: &StoreConfig, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = config.open_attempts.max(1);
    let mut last_error = String::new();
    for n in 1..=attempts {
        let outcome = match tokio::time::timeout(config.open_timeout, attempt(n)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op: "open",
                after: config.open_timeout,
            }),
        };
        match outcome {
            Ok(value) => {
                if n > 1 {
                    tracing::info!(attempt = n, "chunk store opened after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                tracing::warn!(attempt = n, attempts, error = %err, "chunk store open failed");
                last_error = err.to_string();
                if n < attempts {
                    tokio::time::sleep(config.retry_delay(n as usize - 1)).await;
                }
            }
        }
    }
    Err(StoreError::Unavailable {
        attempts,
        message: last_error,
    })
}

fn open_pool(config: &StoreConfig) -> Result<Pool<SqliteConnectionManager>, StoreError> {
    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let manager = SqliteConnectionManager::file(&config.path).with_init(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 2000;")?;
        Ok(())
    });
    let pool = Pool::builder()
        .max_size(config.pool_size.max(1))
        .connection_timeout(config.op_timeout.max(Duration::from_millis(100)))
        .build(manager)?;
    {
        let conn = pool.get()?;
        init_schema(&conn)?;
    }
    Ok(pool)
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);")?;
    let version: Option<i32> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|v| v.parse().ok());

    if let Some(found) = version {
        if found != SCHEMA_VERSION {
            // Cached audio is disposable; rebuild instead of migrating.
            tracing::info!(found, expected = SCHEMA_VERSION, "chunk store schema changed, resetting");
            conn.execute_batch("DROP TABLE IF EXISTS blocks; DROP TABLE IF EXISTS tracks;")?;
        }
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            track_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            sample_rate INTEGER NOT NULL,
            channel_count INTEGER NOT NULL,
            total_block_count INTEGER NOT NULL,
            source_url TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            last_accessed_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blocks (
            track_id TEXT NOT NULL,
            block_index INTEGER NOT NULL,
            sample_rate INTEGER NOT NULL,
            sample_count INTEGER NOT NULL,
            channel_count INTEGER NOT NULL,
            payload_bytes INTEGER NOT NULL,
            payload BLOB NOT NULL,
            PRIMARY KEY (track_id, block_index),
            FOREIGN KEY(track_id) REFERENCES tracks(track_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_blocks_track_id ON blocks(track_id);
        CREATE INDEX IF NOT EXISTS idx_tracks_last_accessed ON tracks(last_accessed_at_ms);
        "#,
    )?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn evict_tracks(
    conn: &mut Connection,
    now_ms: i64,
    max_age_ms: i64,
    max_total: u64,
) -> Result<EvictionReport, StoreError> {
    let tx = conn.transaction()?;
    let usage: Vec<(String, i64, u64)> = {
        let mut stmt = tx.prepare(
            r#"
            SELECT t.track_id, t.last_accessed_at_ms, COALESCE(SUM(b.payload_bytes), 0)
            FROM tracks t LEFT JOIN blocks b ON b.track_id = t.track_id
            GROUP BY t.track_id
            ORDER BY t.last_accessed_at_ms ASC, t.track_id ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut report = EvictionReport::default();
    let mut remaining = Vec::with_capacity(usage.len());
    for (track_id, accessed, bytes) in usage {
        if now_ms.saturating_sub(accessed) > max_age_ms {
            report.bytes_freed += bytes;
            report.expired.push(track_id);
        } else {
            remaining.push((track_id, bytes));
        }
    }

    let mut total: u64 = remaining.iter().map(|(_, bytes)| bytes).sum();
    for (track_id, bytes) in remaining {
        if total <= max_total {
            break;
        }
        total -= bytes;
        report.bytes_freed += bytes;
        report.over_budget.push(track_id);
    }

    for track_id in report.expired.iter().chain(report.over_budget.iter()) {
        tx.execute("DELETE FROM blocks WHERE track_id = ?1", params![track_id])?;
        tx.execute("DELETE FROM tracks WHERE track_id = ?1", params![track_id])?;
    }
    tx.commit()?;
    Ok(report)
}

const TRACK_COLUMNS: &str = "track_id, display_name, duration_seconds, sample_rate, channel_count, \
     total_block_count, source_url, file_size_bytes, last_accessed_at_ms";

struct RawTrack {
    track_id: String,
    display_name: String,
    duration_seconds: f64,
    sample_rate: i64,
    channel_count: i64,
    total_block_count: i64,
    source_url: String,
    file_size_bytes: i64,
    last_accessed_at_ms: i64,
}

impl RawTrack {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            track_id: row.get(0)?,
            display_name: row.get(1)?,
            duration_seconds: row.get(2)?,
            sample_rate: row.get(3)?,
            channel_count: row.get(4)?,
            total_block_count: row.get(5)?,
            source_url: row.get(6)?,
            file_size_bytes: row.get(7)?,
            last_accessed_at_ms: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<TrackRecord, StoreError> {
        Ok(TrackRecord {
            track_id: self.track_id,
            display_name: deobfuscate(&self.display_name)?,
            duration_seconds: self.duration_seconds,
            sample_rate: self.sample_rate as u32,
            channel_count: self.channel_count as u16,
            total_block_count: self.total_block_count as u32,
            source_url: deobfuscate(&self.source_url)?,
            file_size_bytes: self.file_size_bytes as u64,
            last_accessed_at_ms: self.last_accessed_at_ms,
        })
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig {
            evict_on_open: false,
            ..StoreConfig::at(dir.path().join("cache").join("chunks.sqlite"))
        }
    }

    fn record(id: &str, accessed: i64) -> TrackRecord {
        TrackRecord {
            track_id: id.to_string(),
            display_name: format!("Track {id}"),
            duration_seconds: 12.5,
            sample_rate: 44_100,
            channel_count: 2,
            total_block_count: 3,
            source_url: format!("https://cdn.example.com/{id}.mp3"),
            file_size_bytes: 4_000_000,
            last_accessed_at_ms: accessed,
        }
    }

    fn block(id: &str, index: u32, frames: usize) -> StoredBlock {
        StoredBlock {
            track_id: id.to_string(),
            block_index: index,
            sample_rate: 44_100,
            sample_count: frames as u64,
            channel_payloads: vec![
                (0..frames).map(|i| (i as f32 * 0.001).sin()).collect(),
                (0..frames).map(|i| -(i as f32) / 7.0).collect(),
            ],
        }
    }

    #[tokio::test]
    async fn track_records_round_trip_and_are_masked_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        let rec = record("t1", 1_000);
        store.put_track(&rec).await.expect("put");
        assert_eq!(store.get_track("t1").await.expect("get"), Some(rec));
        assert_eq!(store.get_track("missing").await.expect("get"), None);

        let conn = Connection::open(&store.config().path).expect("raw open");
        let raw: String = conn
            .query_row("SELECT source_url FROM tracks WHERE track_id = 't1'", [], |r| r.get(0))
            .expect("raw url");
        assert!(!raw.contains("example.com"));
    }

    #[tokio::test]
    async fn blocks_are_bit_identical_after_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        store.put_track(&record("t1", 0)).await.expect("put track");
        let blocks: Vec<StoredBlock> = (0..3).map(|i| block("t1", i, 1000 + i as usize)).collect();
        for b in blocks.iter().rev() {
            assert!(store.put_block(b).await.expect("put block"));
        }
        for b in &blocks {
            let got = store
                .get_block("t1", b.block_index)
                .await
                .expect("get")
                .expect("present");
            assert_eq!(got.sample_count, b.sample_count);
            for (a, c) in got.channel_payloads.iter().flatten().zip(b.channel_payloads.iter().flatten()) {
                assert_eq!(a.to_bits(), c.to_bits());
            }
        }
        assert_eq!(store.list_block_indices("t1").await.expect("list"), vec![0, 1, 2]);
        assert_eq!(store.get_block("t1", 9).await.expect("get"), None);
    }

    #[tokio::test]
    async fn blocks_are_immutable_once_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        store.put_track(&record("t1", 0)).await.expect("put track");
        assert!(store.put_block(&block("t1", 0, 10)).await.expect("first"));
        assert!(!store.put_block(&block("t1", 0, 20)).await.expect("second"));
        let got = store.get_block("t1", 0).await.expect("get").expect("present");
        assert_eq!(got.sample_count, 10);
    }

    #[tokio::test]
    async fn mismatched_channel_lengths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        let mut bad = block("t1", 0, 10);
        bad.channel_payloads[1].pop();
        assert!(matches!(
            store.put_block(&bad).await,
            Err(StoreError::InvalidBlock(_))
        ));
    }

    #[tokio::test]
    async fn updating_a_track_keeps_its_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        store.put_track(&record("t1", 0)).await.expect("put track");
        store.put_block(&block("t1", 0, 4)).await.expect("put block");
        let mut updated = record("t1", 5);
        updated.total_block_count = 7;
        store.put_track(&updated).await.expect("update");
        assert_eq!(store.list_block_indices("t1").await.expect("list"), vec![0]);
        assert_eq!(
            store.get_track("t1").await.expect("get").map(|r| r.total_block_count),
            Some(7)
        );
    }

    #[tokio::test]
    async fn delete_track_removes_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        store.put_track(&record("t1", 0)).await.expect("put track");
        store.put_track(&record("t2", 0)).await.expect("put track");
        store.put_block(&block("t1", 0, 4)).await.expect("put block");
        store.put_block(&block("t2", 0, 4)).await.expect("put block");

        assert!(store.delete_track("t1").await.expect("delete"));
        assert!(!store.delete_track("t1").await.expect("delete again"));
        assert_eq!(store.get_track("t1").await.expect("get"), None);
        assert!(store.list_block_indices("t1").await.expect("list").is_empty());
        assert_eq!(store.list_block_indices("t2").await.expect("list"), vec![0]);
    }

    #[tokio::test]
    async fn evict_removes_exactly_the_expired_tracks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        let now = 100 * DAY_MS;
        store.put_track(&record("old-a", now - 11 * DAY_MS)).await.expect("put");
        store.put_track(&record("old-b", now - 30 * DAY_MS)).await.expect("put");
        store.put_track(&record("fresh", now - 9 * DAY_MS)).await.expect("put");
        store.put_track(&record("edge", now - 10 * DAY_MS)).await.expect("put");
        store.put_block(&block("old-a", 0, 8)).await.expect("put block");

        let report = store.evict_at(now).await.expect("evict");
        let mut expired = report.expired.clone();
        expired.sort();
        assert_eq!(expired, vec!["old-a".to_string(), "old-b".to_string()]);
        assert!(report.over_budget.is_empty());
        assert_eq!(report.bytes_freed, 2 * 8 * 4);

        let left: Vec<String> = store
            .list_tracks()
            .await
            .expect("list")
            .into_iter()
            .map(|r| r.track_id)
            .collect();
        assert_eq!(left, vec!["fresh".to_string(), "edge".to_string()]);
    }

    #[tokio::test]
    async fn unbounded_max_age_keeps_old_tracks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(StoreConfig {
            max_age: Duration::from_secs(u64::MAX),
            ..config(&dir)
        })
        .await
        .expect("open");
        let now = 100_000 * DAY_MS;
        store.put_track(&record("ancient", 0)).await.expect("put");

        let report = store.evict_at(now).await.expect("evict");
        assert!(report.expired.is_empty());
        assert_eq!(store.stats().await.expect("stats").tracks, 1);
    }

    #[tokio::test]
    async fn evict_enforces_budget_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(StoreConfig {
            max_total_bytes: 2 * 100 * 2 * 4,
            ..config(&dir)
        })
        .await
        .expect("open");
        let now = 50 * DAY_MS;
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            store.put_track(&record(id, now - (4 - i as i64) * 1000)).await.expect("put");
            store.put_block(&block(id, 0, 100)).await.expect("put block");
        }

        let report = store.evict_at(now).await.expect("evict");
        assert!(report.expired.is_empty());
        assert_eq!(report.over_budget, vec!["a".to_string(), "b".to_string()]);
        let stats = store.stats().await.expect("stats");
        assert_eq!(stats, StoreStats { tracks: 2, blocks: 2, payload_bytes: 1600 });
    }

    #[tokio::test]
    async fn touch_refreshes_access_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::open(config(&dir)).await.expect("open");
        store.put_track(&record("t1", 0)).await.expect("put");
        assert!(store.touch_track_at("t1", 42).await.expect("touch"));
        assert!(!store.touch_track_at("nope", 42).await.expect("touch"));
        let rec = store.get_track("t1").await.expect("get").expect("present");
        assert_eq!(rec.last_accessed_at_ms, 42);
    }

    #[tokio::test]
    async fn reopen_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = ChunkStore::open(config(&dir)).await.expect("open");
            store.put_track(&record("t1", now_ms())).await.expect("put");
        }
        let store = ChunkStore::open(StoreConfig {
            evict_on_open: true,
            ..config(&dir)
        })
        .await
        .expect("reopen");
        assert!(store.get_track("t1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn schema_version_change_resets_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config(&dir);
        {
            let store = ChunkStore::open(cfg.clone()).await.expect("open");
            store.put_track(&record("t1", 0)).await.expect("put");
        }
        {
            let conn = Connection::open(&cfg.path).expect("raw open");
            conn.execute("UPDATE meta SET value = '0' WHERE key = 'schema_version'", [])
                .expect("downgrade");
        }
        let store = ChunkStore::open(cfg).await.expect("reopen");
        assert_eq!(store.stats().await.expect("stats").tracks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_succeeds_on_third_attempt() {
        let cfg = StoreConfig::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = retry_open(&cfg, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(StoreError::Io(std::io::Error::other("database is locked")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.expect("opened"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn open_gives_up_after_all_attempts() {
        let cfg = StoreConfig::default();
        let result: Result<(), _> = retry_open(&cfg, |_| async {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        })
        .await;
        match result {
            Err(StoreError::Unavailable { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_open_attempt_times_out_and_retries() {
        let cfg = StoreConfig {
            open_timeout: Duration::from_secs(10),
            ..StoreConfig::default()
        };
        let result = retry_open(&cfg, |attempt| async move {
            if attempt == 1 {
                std::future::pending::<()>().await;
            }
            Ok(attempt)
        })
        .await;
        assert_eq!(result.expect("opened"), 2);
    }
}
