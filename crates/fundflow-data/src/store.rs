//! SQLite cache of completed traces.
//!
//! A trace is stored as one `traces` row plus its ordered ledger rows in
//! `fund_flow_records`, so exports and graphs can be regenerated without
//! calling the providers again. Uses WAL mode and prepared statements for
//! batch inserts.

use std::cell::RefCell;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::types::FundFlowRecord;

/// Metadata of one cached trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceMeta {
    /// Row id of the trace.
    pub id: i64,
    /// Seed address.
    pub root_address: String,
    /// Block the seed received the traced funds in.
    pub start_block: u64,
    /// Case total fixed at hop 1, in BTC.
    pub case_total_btc: f64,
    /// When the trace was stored.
    pub created_at: DateTime<Utc>,
    /// Number of ledger rows.
    pub total_records: usize,
}

/// A cached trace with its ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedTrace {
    pub meta: TraceMeta,
    pub records: Vec<FundFlowRecord>,
}

pub struct Store {
    conn: RefCell<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open SQLite database {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_address TEXT NOT NULL,
                start_block INTEGER NOT NULL,
                case_total_btc REAL NOT NULL,
                created_at TEXT NOT NULL,
                total_records INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fund_flow_records (
                trace_id INTEGER NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                seed_case TEXT,
                path_id INTEGER,
                hop INTEGER,
                follow INTEGER,
                input TEXT,
                output TEXT,
                wallet_id TEXT,
                wallet_classification TEXT,
                wallet_label TEXT,
                txid TEXT,
                event_time TEXT,
                mov_type TEXT,
                btc REAL,
                classification TEXT,
                btc_added_to_flow_from_others REAL,
                btc_not_followed REAL,
                notes TEXT,
                PRIMARY KEY (trace_id, seq)
            );
            ",
        )?;
        Ok(())
    }

    /// Stores a trace and its records in one transaction, returning the new
    /// trace id.
    ///
    /// # Errors
    /// Returns error if database insert fails.
    pub fn save_trace(
        &self,
        root_address: &str,
        start_block: u64,
        case_total_btc: f64,
        records: &[FundFlowRecord],
    ) -> Result<i64> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        tx.execute(
            "
            INSERT INTO traces (root_address, start_block, case_total_btc, created_at, total_records)
            VALUES (?, ?, ?, ?, ?)
            ",
            rusqlite::params![
                root_address,
                start_block,
                case_total_btc,
                Utc::now().to_rfc3339(),
                records.len(),
            ],
        )?;
        let trace_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO fund_flow_records (
                    trace_id, seq, seed_case, path_id, hop, follow, input, output,
                    wallet_id, wallet_classification, wallet_label, txid, event_time,
                    mov_type, btc, classification, btc_added_to_flow_from_others,
                    btc_not_followed, notes
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;

            for (seq, r) in records.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    trace_id,
                    seq,
                    r.seed_case,
                    r.path_id,
                    r.hop,
                    r.follow,
                    r.input,
                    r.output,
                    r.wallet_id,
                    r.wallet_classification.as_str(),
                    r.wallet_label,
                    r.txid,
                    r.event_time.map(|t| t.to_rfc3339()),
                    r.mov_type.as_str(),
                    r.btc,
                    r.classification,
                    r.btc_added_to_flow_from_others,
                    r.btc_not_followed,
                    r.notes,
                ])?;
            }
        }

        tx.commit()?;
        tracing::info!(trace_id, root_address, records = records.len(), "trace cached");
        Ok(trace_id)
    }

    /// Lists cached traces, newest first.
    ///
    /// # Errors
    /// Returns error if the query fails or a row cannot be decoded.
    pub fn list_traces(&self) -> Result<Vec<TraceMeta>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT id, root_address, start_block, case_total_btc, created_at, total_records
            FROM traces ORDER BY id DESC
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, usize>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, root_address, start_block, case_total_btc, created_at, total_records)| {
                Ok(TraceMeta {
                    id,
                    root_address,
                    start_block,
                    case_total_btc,
                    created_at: parse_created_at(&created_at)?,
                    total_records,
                })
            })
            .collect()
    }

    /// Loads a cached trace with its records in stored order.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored value cannot be decoded.
    pub fn load_trace(&self, id: i64) -> Result<Option<CachedTrace>> {
        let conn = self.conn.borrow();
        let meta = conn
            .query_row(
                "
                SELECT id, root_address, start_block, case_total_btc, created_at, total_records
                FROM traces WHERE id = ?
                ",
                rusqlite::params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, usize>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, root_address, start_block, case_total_btc, created_at, total_records)) = meta
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "
            SELECT seed_case, path_id, hop, follow, input, output, wallet_id,
                   wallet_classification, wallet_label, txid, event_time, mov_type, btc,
                   classification, btc_added_to_flow_from_others, btc_not_followed, notes
            FROM fund_flow_records WHERE trace_id = ? ORDER BY seq
            ",
        )?;

        type RawRecord = (
            String,
            u64,
            u32,
            bool,
            String,
            String,
            Option<String>,
            String,
            String,
            String,
            Option<String>,
            String,
            f64,
            String,
            f64,
            f64,
            String,
        );

        let raw: Vec<RawRecord> = stmt
            .query_map(rusqlite::params![id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                    row.get(14)?,
                    row.get(15)?,
                    row.get(16)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(raw.len());
        for r in raw {
            records.push(FundFlowRecord {
                seed_case: r.0,
                path_id: r.1,
                hop: r.2,
                follow: r.3,
                input: r.4,
                output: r.5,
                wallet_id: r.6,
                wallet_classification: r.7.parse()?,
                wallet_label: r.8,
                txid: r.9,
                event_time: r
                    .10
                    .map(|t| DateTime::parse_from_rfc3339(&t))
                    .transpose()
                    .wrap_err("failed to parse stored event_time")?,
                mov_type: r.11.parse()?,
                btc: r.12,
                classification: r.13,
                btc_added_to_flow_from_others: r.14,
                btc_not_followed: r.15,
                notes: r.16,
            });
        }

        Ok(Some(CachedTrace {
            meta: TraceMeta {
                id,
                root_address,
                start_block,
                case_total_btc,
                created_at: parse_created_at(&created_at)?,
                total_records,
            },
            records,
        }))
    }

    /// Deletes one cached trace. Returns false if it did not exist.
    ///
    /// # Errors
    /// Returns error if the delete fails.
    pub fn delete_trace(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .borrow_mut()
            .execute("DELETE FROM traces WHERE id = ?", rusqlite::params![id])?;
        Ok(deleted > 0)
    }

    /// Deletes every cached trace, returning how many were removed.
    ///
    /// # Errors
    /// Returns error if the delete fails.
    pub fn clear(&self) -> Result<usize> {
        let deleted = self.conn.borrow_mut().execute("DELETE FROM traces", [])?;
        Ok(deleted)
    }
}

fn parse_created_at(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .wrap_err_with(|| format!("invalid created_at timestamp '{value}'"))?
        .with_timezone(&Utc))
}
