use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::job::{spawn_job, JobContext, JobHandle, JobSummary};

const WAIT_POLL: Duration = Duration::from_millis(5);
const STATUS_LOCK_WAIT: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Idle,
    Running,
    Stopping,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub job_id: Option<u64>,
    pub source: Option<String>,
    pub frames_processed: u64,
}

#[derive(Default)]
struct Slot {
    current: Option<JobHandle>,
    last_job_id: u64,
    generation: u64,
    last_summary: Option<JobSummary>,
}

/// Owns the single running job. `submit` and `shutdown` are serialized on
/// the slot mutex and always join the old thread before touching shared state.
pub struct JobSupervisor {
    ctx: JobContext,
    slot: Mutex<Slot>,
    /// Callers of `submit`/`shutdown`, counted before they take the slot.
    restarting: AtomicUsize,
}

/// Decrements the restart counter however the restart ends.
struct Restarting<'a>(&'a AtomicUsize);

impl<'a> Restarting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Restarting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobSupervisor {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            slot: Mutex::new(Slot::default()),
            restarting: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Stop and join whatever runs, reset the live state, start on `source`.
    pub fn submit(&self, source: PathBuf) -> Result<u64> {
        let _restarting = Restarting::enter(&self.restarting);
        let mut slot = self.slot.lock();
        self.stop_current(&mut slot);

        slot.generation += 1;
        self.ctx.live.reset(slot.generation, &self.ctx.heatmap);

        slot.last_job_id += 1;
        let id = slot.last_job_id;
        let handle = spawn_job(self.ctx.clone(), id, slot.generation, source.clone())?;
        info!(job = id, source = %source.display(), "job submitted");
        slot.current = Some(handle);
        Ok(id)
    }

    pub fn shutdown(&self) {
        let _restarting = Restarting::enter(&self.restarting);
        let mut slot = self.slot.lock();
        self.stop_current(&mut slot);
    }

    fn stop_current(&self, slot: &mut Slot) {
        let Some(handle) = slot.current.take() else {
            return;
        };
        let id = handle.id;
        handle.stop();
        match handle.join() {
            Ok(summary) => {
                info!(job = id, outcome = ?summary.outcome, "previous job joined");
                slot.last_summary = Some(summary);
            }
            Err(err) => warn!("{err:#}"),
        }
    }

    /// Reap a job that ended on its own so `status` reports idle.
    fn reap(slot: &mut Slot) {
        if slot.current.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = slot.current.take() {
                match handle.join() {
                    Ok(summary) => slot.last_summary = Some(summary),
                    Err(err) => warn!("{err:#}"),
                }
            }
        }
    }

    pub fn status(&self) -> JobStatus {
        let stopping = JobStatus {
            phase: JobPhase::Stopping,
            job_id: None,
            source: None,
            frames_processed: 0,
        };
        if self.restarting.load(Ordering::SeqCst) > 0 {
            return stopping;
        }
        // only a restart holds the slot for longer than a poll
        let Some(mut slot) = self.slot.try_lock_for(STATUS_LOCK_WAIT) else {
            return stopping;
        };
        Self::reap(&mut slot);
        match slot.current.as_ref() {
            Some(h) => JobStatus {
                phase: JobPhase::Running,
                job_id: Some(h.id),
                source: Some(h.source.display().to_string()),
                frames_processed: h.frames_processed(),
            },
            None => JobStatus {
                phase: JobPhase::Idle,
                job_id: slot.last_summary.as_ref().map(|s| s.job_id),
                source: None,
                frames_processed: slot
                    .last_summary
                    .as_ref()
                    .map(|s| s.frames_processed)
                    .unwrap_or(0),
            },
        }
    }

    /// Summary of the most recently finished job, reaping it if needed.
    pub fn last_summary(&self) -> Option<JobSummary> {
        let mut slot = self.slot.lock();
        Self::reap(&mut slot);
        slot.last_summary.clone()
    }

    /// Block until the current job ends on its own. The handle stays in the
    /// slot while waiting, so a concurrent `submit` still stops and joins it.
    pub fn wait(&self) -> Option<JobSummary> {
        loop {
            {
                let mut slot = self.slot.lock();
                let finished = slot.current.as_ref()?.is_finished();
                if finished {
                    Self::reap(&mut slot);
                    return slot.last_summary.clone();
                }
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
