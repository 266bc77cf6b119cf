use anyhow::{anyhow, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::analytics::{annotate, FpsMeter, FrameAnalyzer};
use crate::config::{ConfigStore, DetectorConfig, HeatmapConfig, JobConfig, TrackerConfig};
use crate::detector::{encode_jpeg, select_targets, Detector, HttpDetector};
use crate::persist::{LiveSink, SessionStart};
use crate::snapshot::{FrameUpdate, LiveState};
use crate::state::OccupancyStatus;
use crate::tracker::{ByteTrackAdapter, TrackedBox, Tracker};
use crate::video::{source_display_name, FfmpegSource, FrameSource};

/// Builds fresh collaborators for every job so no tracker state crosses jobs.
pub trait PipelineFactory: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
    fn detector(&self) -> Result<Box<dyn Detector>>;
    fn tracker(&self) -> Result<Box<dyn Tracker>>;
}

pub struct DefaultFactory {
    detector: DetectorConfig,
    tracker: TrackerConfig,
}

impl DefaultFactory {
    pub fn new(detector: DetectorConfig, tracker: TrackerConfig) -> Self {
        Self { detector, tracker }
    }
}

impl PipelineFactory for DefaultFactory {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(path)?))
    }

    fn detector(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(HttpDetector::new(&self.detector)))
    }

    fn tracker(&self) -> Result<Box<dyn Tracker>> {
        Ok(Box::new(ByteTrackAdapter::new(&self.tracker)))
    }
}

/// Shared handles every job runs against.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<ConfigStore>,
    pub live: Arc<LiveState>,
    pub sink: Arc<dyn LiveSink>,
    pub factory: Arc<dyn PipelineFactory>,
    pub heatmap: HeatmapConfig,
    pub job: JobConfig,
    pub target_class: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Stream ran out.
    Exhausted,
    Stopped,
    /// Superseded by a newer job before it could publish.
    Superseded,
    OpenFailed(String),
    ReadErrors(u32),
}

#[derive(Clone, Debug)]
pub struct JobSummary {
    pub job_id: u64,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub outcome: JobOutcome,
}

pub struct JobHandle {
    pub id: u64,
    pub generation: u64,
    pub source: PathBuf,
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    join: JoinHandle<JobSummary>,
}

impl JobHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn frames_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn join(self) -> Result<JobSummary> {
        self.join
            .join()
            .map_err(|_| anyhow!("Job {} thread panicked", self.id))
    }
}

pub fn spawn_job(ctx: JobContext, id: u64, generation: u64, source: PathBuf) -> Result<JobHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let processed = Arc::new(AtomicU64::new(0));
    let stop_thread = Arc::clone(&stop);
    let processed_thread = Arc::clone(&processed);
    let path = source.clone();
    let join = thread::Builder::new()
        .name(format!("job-{id}"))
        .spawn(move || run_job(&ctx, id, generation, &path, &stop_thread, &processed_thread))?;
    Ok(JobHandle {
        id,
        generation,
        source,
        stop,
        processed,
        join,
    })
}

/// The frame loop. Never panics the caller and never leaves a half-written
/// snapshot; every failure ends up in the returned outcome or a log line.
pub fn run_job(
    ctx: &JobContext,
    job_id: u64,
    generation: u64,
    path: &Path,
    stop: &AtomicBool,
    processed: &AtomicU64,
) -> JobSummary {
    let mut summary = JobSummary {
        job_id,
        frames_read: 0,
        frames_processed: 0,
        outcome: JobOutcome::Stopped,
    };

    let setup = ctx.factory.open_source(path).and_then(|source| {
        let detector = ctx.factory.detector()?;
        let tracker = ctx.factory.tracker()?;
        Ok((source, detector, tracker))
    });
    let (mut source, mut detector, mut tracker) = match setup {
        Ok(parts) => parts,
        Err(err) => {
            error!(job = job_id, "Could not open input {}: {err:#}", path.display());
            summary.outcome = JobOutcome::OpenFailed(format!("{err:#}"));
            return summary;
        }
    };

    let info = source.info();
    info!(
        job = job_id,
        source = %path.display(),
        width = info.width,
        height = info.height,
        fps = info.fps,
        "job started"
    );
    ctx.sink.begin_session(&SessionStart {
        job_id,
        source: path.display().to_string(),
        source_label: source_display_name(path),
        info,
        config_json: serde_json::to_string(&ctx.config.get()).unwrap_or_default(),
        started_at: Utc::now(),
    });

    let mut analyzer = FrameAnalyzer::new(info.width, info.height, &ctx.heatmap, ctx.job.evict_after);
    let mut fps = FpsMeter::default();
    let mut frame_counter: u64 = 0;
    let mut read_errors: u32 = 0;
    let mut last_status = OccupancyStatus::Normal;

    summary.outcome = loop {
        if stop.load(Ordering::Relaxed) {
            break JobOutcome::Stopped;
        }

        let frame = match source.read() {
            Ok(Some(frame)) => {
                read_errors = 0;
                Some(frame)
            }
            Ok(None) => break JobOutcome::Exhausted,
            Err(err) => {
                read_errors += 1;
                warn!(job = job_id, "frame read failed ({read_errors}): {err:#}");
                if read_errors > ctx.job.max_read_errors {
                    break JobOutcome::ReadErrors(read_errors);
                }
                None
            }
        };
        frame_counter += 1;
        summary.frames_read = frame_counter;

        let settings = ctx.config.detection();
        if frame_counter % settings.stride() != 0 {
            continue;
        }

        let inputs = match frame.as_ref() {
            Some(img) => {
                let dets = detector.detect(img, settings.confidence).unwrap_or_else(|err| {
                    warn!(job = job_id, frame = frame_counter, "detector failed: {err:#}");
                    Vec::new()
                });
                select_targets(&dets, ctx.target_class)
            }
            None => Vec::new(),
        };
        // hiccups still step the tracker so its ages match the ledger's
        let tracks: Vec<TrackedBox> = tracker.update(&inputs).unwrap_or_else(|err| {
            warn!(job = job_id, frame = frame_counter, "tracker failed: {err:#}");
            Vec::new()
        });

        let analysis = analyzer.process(&tracks);
        for (id, crossing) in &analysis.crossings {
            debug!(job = job_id, track = id, ?crossing, "line crossing");
        }
        if analysis.evicted > 0 {
            debug!(job = job_id, evicted = analysis.evicted, "stale tracks dropped");
        }

        let counts = analyzer.counts(analysis.inside);
        let status = OccupancyStatus::classify(counts.inside, settings.max_occupancy);
        let new_alert = status == OccupancyStatus::Critical && last_status != OccupancyStatus::Critical;
        if new_alert {
            warn!(
                job = job_id,
                inside = counts.inside,
                max = settings.max_occupancy,
                channels = ?ctx.config.alerts().enabled(),
                "occupancy over capacity"
            );
        } else if status != last_status {
            info!(job = job_id, status = status.as_str(), inside = counts.inside, "occupancy status changed");
        }
        last_status = status;

        let proc_fps = fps.tick();
        let jpeg = frame.map(|mut img| {
            annotate(&mut img, &tracks, &counts, status, proc_fps);
            encode_jpeg(&img, ctx.job.stream_jpeg_quality)
        });
        let jpeg = match jpeg {
            Some(Ok(bytes)) => Some(Arc::new(bytes)),
            Some(Err(err)) => {
                warn!(job = job_id, "frame encode failed: {err:#}");
                None
            }
            None => None,
        };

        if stop.load(Ordering::Relaxed) {
            break JobOutcome::Stopped;
        }
        let published = ctx.live.publish(
            generation,
            FrameUpdate {
                counts,
                heatmap: analyzer.heatmap_view(),
                frame: jpeg,
                frame_index: frame_counter,
                status,
                alert_active: status == OccupancyStatus::Critical,
                new_alert,
            },
        );
        if !published {
            break JobOutcome::Superseded;
        }
        summary.frames_processed += 1;
        processed.store(summary.frames_processed, Ordering::Relaxed);

        if let Err(err) = ctx.sink.write_live_snapshot(counts, Utc::now()) {
            warn!(job = job_id, "live sink write failed: {err:#}");
        }
    };

    ctx.sink.end_session(job_id, Utc::now());
    info!(
        job = job_id,
        frames = summary.frames_read,
        processed = summary.frames_processed,
        outcome = ?summary.outcome,
        entered = analyzer.counts(0).entered,
        exited = analyzer.counts(0).exited,
        "job finished"
    );
    summary
}
