use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::state::LiveCounts;

const SCHEMA_VERSION: i32 = 1;

pub struct SessionInfo<'a> {
    pub job_id: u64,
    pub started_at: &'a str,
    pub source: &'a str,
    pub source_label: &'a str,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub config_json: &'a str,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn create_session(&mut self, info: &SessionInfo<'_>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sessions (job_id, started_at, source, source_label, fps, width, height, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                info.job_id as i64,
                info.started_at,
                info.source,
                info.source_label,
                info.fps,
                info.width,
                info.height,
                info.config_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_session(&mut self, session_id: i64, ended_at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE id = ?2",
            params![ended_at, session_id],
        )?;
        Ok(())
    }

    pub fn upsert_live(&mut self, session_id: Option<i64>, counts: &LiveCounts, ts: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO live_state (id, session_id, entered, exited, inside, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                entered = excluded.entered,
                exited = excluded.exited,
                inside = excluded.inside,
                updated_at = excluded.updated_at",
            params![
                session_id,
                counts.entered as i64,
                counts.exited as i64,
                counts.inside as i64,
                ts
            ],
        )?;
        Ok(())
    }

    pub fn insert_sample(&mut self, session_id: i64, counts: &LiveCounts, ts: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO occupancy_samples (session_id, ts, entered, exited, inside)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                ts,
                counts.entered as i64,
                counts.exited as i64,
                counts.inside as i64
            ],
        )?;
        Ok(())
    }

    pub fn live(&self) -> Result<Option<LiveCounts>> {
        let row = self
            .conn
            .query_row(
                "SELECT entered, exited, inside FROM live_state WHERE id = 1",
                [],
                |row| {
                    Ok(LiveCounts {
                        entered: row.get::<_, i64>(0)? as u64,
                        exited: row.get::<_, i64>(1)? as u64,
                        inside: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn sample_count(&self, session_id: i64) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM occupancy_samples WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        let user_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if user_version < SCHEMA_VERSION {
            let _ = conn.execute("DROP TABLE IF EXISTS occupancy_samples", []);
            let _ = conn.execute("DROP TABLE IF EXISTS live_state", []);
            let _ = conn.execute("DROP TABLE IF EXISTS sessions", []);
        }
        conn.execute_batch(include_str!("../schema.sql"))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(db: &mut Db) -> i64 {
        db.create_session(&SessionInfo {
            job_id: 1,
            started_at: "2024-01-01T00:00:00Z",
            source: "uploads/a.mp4",
            source_label: "a",
            fps: 25.0,
            width: 640,
            height: 480,
            config_json: "{}",
        })
        .unwrap()
    }

    #[test]
    fn live_row_is_overwritten_in_place() {
        let mut db = Db::open_in_memory().unwrap();
        assert_eq!(db.live().unwrap(), None);
        let sid = session(&mut db);
        let first = LiveCounts { entered: 1, exited: 0, inside: 3 };
        let second = LiveCounts { entered: 4, exited: 2, inside: 5 };
        db.upsert_live(Some(sid), &first, "t1").unwrap();
        db.upsert_live(Some(sid), &second, "t2").unwrap();
        assert_eq!(db.live().unwrap(), Some(second));
    }

    #[test]
    fn samples_accumulate_per_session() {
        let mut db = Db::open_in_memory().unwrap();
        let sid = session(&mut db);
        for i in 0..3 {
            let c = LiveCounts { entered: i, exited: 0, inside: i };
            db.insert_sample(sid, &c, "t").unwrap();
        }
        db.finish_session(sid, "2024-01-01T00:01:00Z").unwrap();
        assert_eq!(db.sample_count(sid).unwrap(), 3);
    }
}
