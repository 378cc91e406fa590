use std::path::Path;

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::types::LeaderboardRow;

/// Leaderboard snapshots, one row per agent per publication.
pub struct LeaderboardStore {
    conn: Connection,
}

impl LeaderboardStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS leaderboard (
                ts INTEGER NOT NULL,
                agent TEXT NOT NULL,
                pnl REAL NOT NULL,
                win_rate REAL NOT NULL,
                eqs REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn persist_snapshot(&mut self, ts: u64, board: &[LeaderboardRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for row in board {
            tx.execute(
                "INSERT INTO leaderboard (ts, agent, pnl, win_rate, eqs) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts as i64, row.agent, row.pnl, row.win_rate, row.eqs],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Rows of the most recent snapshot, best pnl first.
    pub fn latest(&self) -> Result<Vec<LeaderboardRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent, pnl, win_rate, eqs FROM leaderboard
             WHERE ts = (SELECT MAX(ts) FROM leaderboard)
             ORDER BY pnl DESC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(LeaderboardRow { agent: r.get(0)?, pnl: r.get(1)?, win_rate: r.get(2)?, eqs: r.get(3)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn snapshot_count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(DISTINCT ts) FROM leaderboard", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}
