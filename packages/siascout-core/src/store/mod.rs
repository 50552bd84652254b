//! Durable, deduplicated storage for scan results.
//!
//! One SQLite file holds three tables: `hits` (live results),
//! `history_hits` (historical results, identical columns) and
//! `scanned_cidrs` (the live-mode scan cache). Every insert is
//! `INSERT OR IGNORE`, so repeated runs never error on rows they have
//! already written.
//!
//! A single connection is shared behind an async mutex; each multi-write
//! sequence for a block runs as one transaction under one lock hold, so a
//! crash can never leave a block marked scanned with its matches lost.

use crate::api::Listing;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Which hit table a scan writes to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitTable {
    Live,
    History,
}

impl HitTable {
    pub fn name(&self) -> &'static str {
        match self {
            HitTable::Live => "hits",
            HitTable::History => "history_hits",
        }
    }
}

const HIT_COLUMNS: &str = "dataset, ipaddress, asn, cc, listed, seen, valid_until, rule, \
     botname, botname_malpedia, dstport, heuristic, lat, lon, \
     protocol, srcip, domain, helo, detection";

fn hit_schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            dataset          TEXT,
            ipaddress        TEXT,
            asn              INTEGER,
            cc               TEXT,
            listed           INTEGER,
            seen             INTEGER,
            valid_until      INTEGER,
            rule             TEXT,
            botname          TEXT,
            botname_malpedia TEXT,
            dstport          INTEGER,
            heuristic        TEXT,
            lat              REAL,
            lon              REAL,
            protocol         TEXT,
            srcip            TEXT,
            domain           TEXT,
            helo             TEXT,
            detection        TEXT,
            PRIMARY KEY (ipaddress, listed, rule)
        )"
    )
}

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "{};
             {};
             CREATE TABLE IF NOT EXISTS scanned_cidrs (
                 cidr       TEXT PRIMARY KEY,
                 scanned_at INTEGER
             );",
            hit_schema("hits"),
            hit_schema("history_hits"),
        ))
        .context("Failed to initialize database schema")?;
        tracing::debug!("Database schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Has this block already been fully scanned in live mode?
    pub async fn is_scanned(&self, block: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT 1 FROM scanned_cidrs WHERE cidr = ?1")?;
        Ok(stmt.exists(params![block])?)
    }

    /// Record that a block has been queried to completion in live mode.
    /// Duplicate marks are a no-op.
    pub async fn mark_scanned(&self, block: &str, scanned_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO scanned_cidrs (cidr, scanned_at) VALUES (?1, ?2)",
            params![block, scanned_at],
        )?;
        Ok(())
    }

    /// Insert listings into the given hit table. Rows whose
    /// `(ipaddress, listed, rule)` key already exists are silently skipped.
    /// Returns the number of rows actually inserted.
    pub async fn insert_hits(&self, hits: &[Listing], table: HitTable) -> Result<usize> {
        if hits.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = insert_hits_tx(&tx, hits, table)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Persist one block's results atomically: hit inserts and (for live
    /// mode) the scanned mark commit together or not at all.
    pub async fn record_block(
        &self,
        block: &str,
        hits: &[Listing],
        table: HitTable,
        mark_scanned_at: Option<i64>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = insert_hits_tx(&tx, hits, table)?;
        if let Some(ts) = mark_scanned_at {
            tx.execute(
                "INSERT OR IGNORE INTO scanned_cidrs (cidr, scanned_at) VALUES (?1, ?2)",
                params![block, ts],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Total number of rows in a hit table.
    pub async fn count_hits(&self, table: HitTable) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of distinct listed addresses in a hit table.
    pub async fn count_unique_ips(&self, table: HitTable) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            &format!("SELECT COUNT(DISTINCT ipaddress) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of blocks recorded in the scan cache.
    pub async fn count_scanned(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM scanned_cidrs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Top-N values of a column by row count, skipping NULLs and the
    /// literal "unknown". `column` and `extra_where` are internal,
    /// whitelisted strings, never user input.
    pub(crate) async fn top_counts(
        &self,
        table: HitTable,
        column: &str,
        extra_where: Option<&str>,
        n: usize,
    ) -> Result<Vec<(String, i64)>> {
        let extra = extra_where.map(|w| format!("AND {} ", w)).unwrap_or_default();
        let sql = format!(
            "SELECT CAST({col} AS TEXT), COUNT(*) AS c FROM {table} \
             WHERE {col} IS NOT NULL AND CAST({col} AS TEXT) != 'unknown' {extra}\
             GROUP BY {col} ORDER BY c DESC, {col} LIMIT {n}",
            col = column,
            table = table.name(),
        );
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn insert_hits_tx(tx: &rusqlite::Transaction<'_>, hits: &[Listing], table: HitTable) -> Result<usize> {
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES \
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        table.name(),
        HIT_COLUMNS
    );
    let mut stmt = tx.prepare_cached(&sql)?;
    let mut inserted = 0;
    for hit in hits {
        inserted += stmt.execute(params![
            hit.dataset,
            hit.ipaddress,
            hit.asn,
            hit.cc,
            hit.listed,
            hit.seen,
            hit.valid_until,
            hit.rule,
            hit.botname,
            hit.botname_malpedia,
            hit.dstport,
            hit.heuristic,
            hit.lat,
            hit.lon,
            hit.protocol,
            hit.srcip,
            hit.domain,
            hit.helo,
            hit.detection,
        ])?;
    }
    Ok(inserted)
}
