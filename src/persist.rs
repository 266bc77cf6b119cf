use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::{Db, SessionInfo};
use crate::state::LiveCounts;
use crate::video::FrameInfo;

/// What a job knows about itself when it starts.
#[derive(Clone, Debug)]
pub struct SessionStart {
    pub job_id: u64,
    pub source: String,
    pub source_label: String,
    pub info: FrameInfo,
    pub config_json: String,
    pub started_at: DateTime<Utc>,
}

/// External store for the running counts. Implementations must never block
/// the frame loop for long.
pub trait LiveSink: Send + Sync {
    fn begin_session(&self, _start: &SessionStart) {}
    fn write_live_snapshot(&self, counts: LiveCounts, at: DateTime<Utc>) -> Result<()>;
    fn end_session(&self, _job_id: u64, _at: DateTime<Utc>) {}
    fn shutdown(&self) {}
}

pub struct NullSink;

impl LiveSink for NullSink {
    fn write_live_snapshot(&self, _counts: LiveCounts, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

enum SinkMsg {
    Begin(SessionStart),
    Live { counts: LiveCounts, at: DateTime<Utc> },
    End { job_id: u64, at: DateTime<Utc> },
}

const CONTROL_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// SQLite-backed sink. All database work happens on one writer thread.
pub struct SqliteSink {
    tx: Mutex<Option<Sender<SinkMsg>>>,
    join: Mutex<Option<JoinHandle<Db>>>,
}

impl SqliteSink {
    pub fn open(path: &Path, queue: usize) -> Result<Self> {
        let db = Db::open(path)?;
        info!(path = %path.display(), "SQLite sink ready");
        Ok(Self::with_db(db, queue))
    }

    pub fn with_db(db: Db, queue: usize) -> Self {
        let (tx, rx) = bounded::<SinkMsg>(queue.max(1));
        let join = thread::spawn(move || writer_loop(db, rx));
        Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }

    fn send_control(&self, msg: SinkMsg) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if tx.send_timeout(msg, CONTROL_SEND_TIMEOUT).is_err() {
            warn!("SQLite sink busy; session record dropped");
        }
    }

    /// Close the queue, let the writer drain it, and hand the database back.
    pub fn close(&self) -> Option<Db> {
        self.tx.lock().take();
        let handle = self.join.lock().take()?;
        match handle.join() {
            Ok(db) => Some(db),
            Err(_) => {
                warn!("SQLite writer thread panicked");
                None
            }
        }
    }
}

impl LiveSink for SqliteSink {
    fn begin_session(&self, start: &SessionStart) {
        self.send_control(SinkMsg::Begin(start.clone()));
    }

    fn write_live_snapshot(&self, counts: LiveCounts, at: DateTime<Utc>) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or_else(|| anyhow!("sink closed"))?;
        match tx.try_send(SinkMsg::Live { counts, at }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("sink queue full")),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("sink writer gone")),
        }
    }

    fn end_session(&self, job_id: u64, at: DateTime<Utc>) {
        self.send_control(SinkMsg::End { job_id, at });
    }

    fn shutdown(&self) {
        let _ = self.close();
    }
}

impl Drop for SqliteSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn writer_loop(mut db: Db, rx: Receiver<SinkMsg>) -> Db {
    // (job_id, session row)
    let mut current: Option<(u64, i64)> = None;
    for msg in rx.iter() {
        let res = match msg {
            SinkMsg::Begin(start) => {
                let started = stamp(start.started_at);
                db.create_session(&SessionInfo {
                    job_id: start.job_id,
                    started_at: &started,
                    source: &start.source,
                    source_label: &start.source_label,
                    fps: start.info.fps,
                    width: start.info.width,
                    height: start.info.height,
                    config_json: &start.config_json,
                })
                .map(|sid| {
                    debug!(job = start.job_id, session = sid, "session opened");
                    current = Some((start.job_id, sid));
                })
            }
            SinkMsg::Live { counts, at } => {
                let ts = stamp(at);
                let sid = current.map(|(_, sid)| sid);
                db.upsert_live(sid, &counts, &ts).and_then(|_| match sid {
                    Some(sid) => db.insert_sample(sid, &counts, &ts),
                    None => Ok(()),
                })
            }
            SinkMsg::End { job_id, at } => match current {
                Some((jid, sid)) if jid == job_id => {
                    current = None;
                    db.finish_session(sid, &stamp(at))
                }
                _ => Ok(()),
            },
        };
        if let Err(err) = res {
            warn!("SQLite write failed: {err:#}");
        }
    }
    db
}
