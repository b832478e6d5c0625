use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::contract::{Envelope, Priority};
use crate::error::{CoreError, CoreResult};

/// Envelope waiting for a route to its recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEnvelope {
    pub seq: i64,
    pub target: String,
    pub envelope: Envelope,
    pub attempts: u32,
    pub next_attempt_at: i64,
}

/// Durable queue of undeliverable envelopes, one row per (target, envelope).
pub struct Outbox {
    conn: Connection,
}

fn priority_rank(p: Priority) -> i64 {
    match p {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

type Row = (i64, String, String, i64, i64);

fn decode(rows: Vec<Row>) -> Vec<QueuedEnvelope> {
    rows.into_iter()
        .filter_map(|(seq, target, body, attempts, next_attempt_at)| {
            let envelope: Envelope = serde_json::from_str(&body).ok()?;
            Some(QueuedEnvelope {
                seq,
                target,
                envelope,
                attempts: attempts.max(0) as u32,
                next_attempt_at,
            })
        })
        .collect()
}

impl Outbox {
    /// `:memory:` keeps the queue in-process; any other path is created on demand.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        };
        let mut outbox = Self { conn };
        outbox.init()?;
        outbox.release_all()?;
        Ok(outbox)
    }

    fn init(&mut self) -> CoreResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                target TEXT NOT NULL,
                envelope_id TEXT NOT NULL,
                body TEXT NOT NULL,
                priority INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                expires_at INTEGER,
                leased_until INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS outbox_target ON outbox (target);
            CREATE INDEX IF NOT EXISTS outbox_due ON outbox (next_attempt_at);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn enqueue(&mut self, target: &str, envelope: &Envelope, next_attempt_at: i64) -> CoreResult<()> {
        let body = serde_json::to_string(envelope).map_err(|e| CoreError::Persistence(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO outbox (target, envelope_id, body, priority, attempts, next_attempt_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                target,
                envelope.id,
                body,
                priority_rank(envelope.priority),
                next_attempt_at,
                envelope.expires_at()
            ],
        )?;
        Ok(())
    }

    /// Record a failed attempt and release the lease until `next_attempt_at`.
    pub fn reschedule(&mut self, entry: &QueuedEnvelope, next_attempt_at: i64) -> CoreResult<()> {
        self.conn.execute(
            "UPDATE outbox SET attempts = ?2, next_attempt_at = ?3, leased_until = 0 WHERE seq = ?1",
            params![entry.seq, entry.attempts as i64 + 1, next_attempt_at],
        )?;
        Ok(())
    }

    /// Claim unleased rows matching `filter` until `lease_until`. Rows stay
    /// in the table until [`Outbox::complete`] removes them.
    fn lease(
        &mut self,
        filter: &str,
        arg: rusqlite::types::Value,
        limit: i64,
        now_ms: i64,
        lease_until: i64,
    ) -> CoreResult<Vec<QueuedEnvelope>> {
        let tx = self.conn.transaction()?;
        let rows: Vec<Row> = {
            let sql = format!(
                "SELECT seq, target, body, attempts, next_attempt_at FROM outbox
                 WHERE {} AND leased_until <= ?3 ORDER BY priority DESC, seq ASC LIMIT ?2",
                filter
            );
            let mut stmt = tx.prepare(&sql)?;
            let mapped = stmt.query_map(params![arg, limit, now_ms], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };
        for (seq, ..) in &rows {
            tx.execute("UPDATE outbox SET leased_until = ?2 WHERE seq = ?1", params![seq, lease_until])?;
        }
        tx.commit()?;
        Ok(decode(rows))
    }

    /// Lease everything queued for `target`, highest priority first.
    pub fn lease_for(&mut self, target: &str, now_ms: i64, lease_until: i64) -> CoreResult<Vec<QueuedEnvelope>> {
        self.lease("target = ?1", target.to_string().into(), i64::MAX, now_ms, lease_until)
    }

    /// Lease up to `limit` entries whose retry time has come.
    pub fn lease_due(&mut self, now_ms: i64, limit: usize, lease_until: i64) -> CoreResult<Vec<QueuedEnvelope>> {
        self.lease("next_attempt_at <= ?1", now_ms.into(), limit as i64, now_ms, lease_until)
    }

    /// Delete rows that were delivered or dropped.
    pub fn complete(&mut self, seqs: &[i64]) -> CoreResult<()> {
        let tx = self.conn.transaction()?;
        for seq in seqs {
            tx.execute("DELETE FROM outbox WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Hand leased rows back without counting an attempt.
    pub fn release(&mut self, seqs: &[i64]) -> CoreResult<()> {
        let tx = self.conn.transaction()?;
        for seq in seqs {
            tx.execute("UPDATE outbox SET leased_until = 0 WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop every lease; a fresh process or a stopped bus owns no attempts.
    pub fn release_all(&mut self) -> CoreResult<usize> {
        Ok(self.conn.execute("UPDATE outbox SET leased_until = 0 WHERE leased_until > 0", [])?)
    }

    /// Delete expired entries, returning `(target, envelope_id)` for each.
    pub fn purge_expired(&mut self, now_ms: i64) -> CoreResult<Vec<(String, String)>> {
        let tx = self.conn.transaction()?;
        let gone: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT target, envelope_id FROM outbox
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND leased_until <= ?1",
            )?;
            let mapped = stmt.query_map(params![now_ms], |r| Ok((r.get(0)?, r.get(1)?)))?;
            mapped.collect::<Result<_, _>>()?
        };
        tx.execute(
            "DELETE FROM outbox WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND leased_until <= ?1",
            params![now_ms],
        )?;
        tx.commit()?;
        Ok(gone)
    }

    pub fn purge_target(&mut self, target: &str) -> CoreResult<usize> {
        Ok(self.conn.execute("DELETE FROM outbox WHERE target = ?1", params![target])?)
    }

    pub fn len(&self) -> CoreResult<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn pending_for(&self, target: &str) -> CoreResult<usize> {
        let n: Option<i64> = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox WHERE target = ?1", params![target], |r| r.get(0))
            .optional()?;
        Ok(n.unwrap_or(0).max(0) as usize)
    }
}
