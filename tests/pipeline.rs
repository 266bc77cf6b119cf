use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crowd_analytics::config::{ConfigStore, DetectionSettings, HeatmapConfig, JobConfig, LiveConfig};
use crowd_analytics::detector::{Detector, RawDetection};
use crowd_analytics::job::{run_job, JobContext, JobOutcome, PipelineFactory};
use crowd_analytics::persist::{LiveSink, SessionStart};
use crowd_analytics::snapshot::LiveState;
use crowd_analytics::state::{BBox, LiveCounts};
use crowd_analytics::supervisor::{JobPhase, JobSupervisor};
use crowd_analytics::tracker::{TrackedBox, Tracker, TrackerInput};
use crowd_analytics::video::{FrameInfo, FrameSource};

const W: u32 = 100;
const H: u32 = 100;

// ================== FAKES ==================

enum Step {
    Frame,
    Hiccup,
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    endless: bool,
    next: u64,
}

/// The frame number rides in the first pixel so the detector can see it.
fn numbered_frame(idx: u64) -> RgbImage {
    RgbImage::from_pixel(W, H, Rgb([(idx % 256) as u8, (idx / 256) as u8, 0]))
}

impl FrameSource for ScriptedSource {
    fn info(&self) -> FrameInfo {
        FrameInfo {
            width: W,
            height: H,
            fps: 25.0,
        }
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        if self.endless {
            thread::sleep(Duration::from_millis(2));
            self.next += 1;
            return Ok(Some(numbered_frame(self.next)));
        }
        match self.steps.pop_front() {
            None => Ok(None),
            Some(Step::Frame) => {
                self.next += 1;
                Ok(Some(numbered_frame(self.next)))
            }
            Some(Step::Hiccup) => Err(anyhow!("decode hiccup")),
        }
    }
}

type Script = Arc<dyn Fn(u64) -> Vec<RawDetection> + Send + Sync>;
type Hook = Arc<dyn Fn(u64) + Send + Sync>;

struct ScriptedDetector {
    script: Script,
    calls: Arc<Mutex<Vec<(u64, f32)>>>,
    hook: Option<Hook>,
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, frame: &RgbImage, confidence: f32) -> Result<Vec<RawDetection>> {
        let px = frame.get_pixel(0, 0);
        let idx = px[0] as u64 + px[1] as u64 * 256;
        self.calls.lock().push((idx, confidence));
        if let Some(hook) = &self.hook {
            hook(idx);
        }
        Ok((self.script)(idx))
    }
}

struct TestFactory {
    script: Script,
    calls: Arc<Mutex<Vec<(u64, f32)>>>,
    hook: Option<Hook>,
}

impl TestFactory {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
            hook: None,
        }
    }

    fn frames_seen(&self) -> Vec<u64> {
        self.calls.lock().iter().map(|(idx, _)| *idx).collect()
    }
}

/// `frames-N`, `hiccups-N`, `endless`; anything else fails to open.
impl PipelineFactory for TestFactory {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("bad path"))?;
        let (steps, endless) = if name == "endless" {
            (VecDeque::new(), true)
        } else if let Some(n) = name.strip_prefix("frames-") {
            let n: usize = n.parse()?;
            ((0..n).map(|_| Step::Frame).collect(), false)
        } else if let Some(n) = name.strip_prefix("hiccups-") {
            let n: usize = n.parse()?;
            ((0..n).map(|_| Step::Hiccup).collect(), false)
        } else {
            return Err(anyhow!("Could not open video {}", path.display()));
        };
        Ok(Box::new(ScriptedSource {
            steps,
            endless,
            next: 0,
        }))
    }

    fn detector(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(ScriptedDetector {
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
            hook: self.hook.clone(),
        }))
    }

    fn tracker(&self) -> Result<Box<dyn Tracker>> {
        Ok(Box::new(LaneTracker))
    }
}

/// One id per 100 px lane, never retired: a tracker that re-finds everyone.
struct LaneTracker;

impl Tracker for LaneTracker {
    fn update(&mut self, detections: &[TrackerInput]) -> Result<Vec<TrackedBox>> {
        Ok(detections
            .iter()
            .map(|d| TrackedBox {
                id: (d.ltwh[0] / 100.0) as u64 + 1,
                confirmed: true,
                bbox: BBox::from_ltwh(d.ltwh),
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<LiveCounts>>,
    sessions: AtomicUsize,
    ended: AtomicUsize,
}

impl LiveSink for RecordingSink {
    fn begin_session(&self, _start: &SessionStart) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
    }

    fn write_live_snapshot(&self, counts: LiveCounts, _at: DateTime<Utc>) -> Result<()> {
        self.writes.lock().push(counts);
        Ok(())
    }

    fn end_session(&self, _job_id: u64, _at: DateTime<Utc>) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

// ================== HELPERS ==================

fn person(cx: f32, cy: f32) -> RawDetection {
    RawDetection {
        bbox: BBox {
            x1: cx - 10.0,
            y1: cy - 10.0,
            x2: cx + 10.0,
            y2: cy + 10.0,
        },
        class_id: 0,
        confidence: 0.9,
    }
}

fn nobody() -> Script {
    Arc::new(|_| Vec::new())
}

/// One person walking up from the bottom, plus a parked car to ignore.
fn walker_up() -> Script {
    Arc::new(|idx| {
        let cy = 90.0 - 3.0 * idx as f32;
        let mut car = person(15.0, 15.0);
        car.class_id = 2;
        vec![person(50.0, cy.max(5.0)), car]
    })
}

fn always_there() -> Script {
    Arc::new(|_| vec![person(50.0, 50.0)])
}

fn context(factory: Arc<TestFactory>, sink: Arc<RecordingSink>, sample_rate: u32) -> JobContext {
    let config = Arc::new(ConfigStore::new(LiveConfig {
        detection: DetectionSettings {
            confidence: 0.5,
            sample_rate,
            max_occupancy: 100,
        },
        ..Default::default()
    }));
    JobContext {
        config,
        live: Arc::new(LiveState::new(&HeatmapConfig::default())),
        sink,
        factory,
        heatmap: HeatmapConfig::default(),
        job: JobConfig {
            evict_after: 30,
            max_read_errors: 3,
            stream_jpeg_quality: 70,
        },
        target_class: 0,
    }
}

fn run(ctx: &JobContext, path: &str) -> crowd_analytics::job::JobSummary {
    let stop = AtomicBool::new(false);
    let processed = AtomicU64::new(0);
    run_job(ctx, 1, ctx.live.generation(), Path::new(path), &stop, &processed)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ================== SCENARIOS ==================

#[test]
fn sample_rate_gates_which_frames_reach_detector() {
    let factory = Arc::new(TestFactory::new(nobody()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory.clone(), sink.clone(), 5);

    let summary = run(&ctx, "frames-20");
    assert_eq!(summary.outcome, JobOutcome::Exhausted);
    assert_eq!(summary.frames_read, 20);
    assert_eq!(summary.frames_processed, 4);
    assert_eq!(factory.frames_seen(), vec![5, 10, 15, 20]);
    assert_eq!(sink.writes.lock().len(), 4);
    assert_eq!(sink.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(sink.ended.load(Ordering::SeqCst), 1);
}

#[test]
fn config_change_applies_on_next_processed_frame() {
    let mut factory = TestFactory::new(nobody());
    let sink = Arc::new(RecordingSink::default());
    let store_slot: Arc<Mutex<Option<Arc<ConfigStore>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&store_slot);
    factory.hook = Some(Arc::new(move |idx| {
        if idx == 2 {
            if let Some(store) = slot.lock().as_ref() {
                store.set(
                    DetectionSettings {
                        confidence: 0.9,
                        sample_rate: 1,
                        max_occupancy: 100,
                    },
                    None,
                );
            }
        }
    }));
    let factory = Arc::new(factory);
    let ctx = context(factory.clone(), sink, 1);
    *store_slot.lock() = Some(Arc::clone(&ctx.config));

    run(&ctx, "frames-4");
    let calls = factory.calls.lock().clone();
    let confs: Vec<f32> = calls.iter().map(|(_, c)| *c).collect();
    assert_eq!(confs, vec![0.5, 0.5, 0.9, 0.9]);
}

#[test]
fn walker_is_counted_once_and_car_is_ignored() {
    let factory = Arc::new(TestFactory::new(walker_up()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);

    let summary = run(&ctx, "frames-20");
    assert_eq!(summary.frames_processed, 20);
    assert_eq!(
        ctx.live.counts(),
        LiveCounts {
            entered: 1,
            exited: 0,
            inside: 1
        }
    );

    let writes = sink.writes.lock();
    assert!(writes.windows(2).all(|w| w[0].entered <= w[1].entered));
    assert!(writes.iter().all(|c| c.inside == 1));
    assert!(ctx.live.frame().is_some());
    assert!(ctx.live.heatmap().zones.iter().any(|z| *z > 0.0));
    assert_eq!(ctx.live.analytics().peak, 1);
}

/// Seen on frames 10 and 20, gone for 30-60, back on 70 and 80 under the
/// same tracker id. At sample rate 10 that gap is only four processed frames.
fn returns_after_gap() -> Script {
    Arc::new(|idx| match idx {
        10 => vec![person(50.0, 48.0)],
        20 => vec![person(50.0, 44.0)],
        70 => vec![person(50.0, 45.0)],
        80 => vec![person(50.0, 41.0)],
        _ => Vec::new(),
    })
}

#[test]
fn skipped_frames_do_not_age_the_ledger() {
    let factory = Arc::new(TestFactory::new(returns_after_gap()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory.clone(), sink.clone(), 10);

    let summary = run(&ctx, "frames-80");
    assert_eq!(summary.frames_processed, 8);
    assert_eq!(factory.frames_seen(), vec![10, 20, 30, 40, 50, 60, 70, 80]);
    assert_eq!(
        ctx.live.counts(),
        LiveCounts {
            entered: 1,
            exited: 0,
            inside: 1
        }
    );
    let writes = sink.writes.lock();
    assert_eq!(writes.len(), 8);
    assert!(writes.iter().all(|c| c.entered <= 1));
}

#[test]
fn read_hiccups_are_processed_as_empty_until_the_limit() {
    let factory = Arc::new(TestFactory::new(always_there()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory.clone(), sink, 1);

    let summary = run(&ctx, "hiccups-10");
    assert_eq!(summary.outcome, JobOutcome::ReadErrors(4));
    assert_eq!(summary.frames_processed, 3);
    assert!(factory.frames_seen().is_empty());
    assert_eq!(ctx.live.counts(), LiveCounts::default());
    assert!(ctx.live.frame().is_none());
}

#[test]
fn stale_generation_cannot_publish() {
    let factory = Arc::new(TestFactory::new(always_there()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);
    ctx.live.reset(3, &HeatmapConfig::default());

    let stop = AtomicBool::new(false);
    let processed = AtomicU64::new(0);
    let summary = run_job(&ctx, 9, 2, Path::new("frames-5"), &stop, &processed);
    assert_eq!(summary.outcome, JobOutcome::Superseded);
    assert_eq!(ctx.live.counts(), LiveCounts::default());
    assert!(sink.writes.lock().is_empty());
}

#[test]
fn fatal_open_leaves_reset_state() {
    let factory = Arc::new(TestFactory::new(always_there()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);
    let supervisor = JobSupervisor::new(ctx.clone());

    supervisor.submit(PathBuf::from("frames-3")).unwrap();
    supervisor.wait().unwrap();
    assert_eq!(ctx.live.counts().inside, 1);

    supervisor.submit(PathBuf::from("no-such-file.mp4")).unwrap();
    let summary = supervisor.wait().unwrap();
    assert!(matches!(summary.outcome, JobOutcome::OpenFailed(_)));
    assert_eq!(ctx.live.counts(), LiveCounts::default());
    assert!(ctx.live.frame().is_none());
    assert!(ctx.live.heatmap().zones.iter().all(|z| *z == 0.0));
    assert_eq!(sink.sessions.load(Ordering::SeqCst), 1);
}

#[test]
fn resubmit_stops_old_job_and_resets_counts() {
    let factory = Arc::new(TestFactory::new(always_there()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);
    let supervisor = JobSupervisor::new(ctx.clone());

    let first = supervisor.submit(PathBuf::from("endless")).unwrap();
    assert!(wait_until(|| ctx.live.counts().inside == 1));
    assert_eq!(supervisor.status().phase, JobPhase::Running);
    assert_eq!(supervisor.status().job_id, Some(first));

    let second = supervisor.submit(PathBuf::from("frames-0")).unwrap();
    assert_eq!(second, first + 1);
    // the old job was joined inside submit
    assert!(sink.ended.load(Ordering::SeqCst) >= 1);

    let summary = supervisor.wait().unwrap();
    assert_eq!(summary.job_id, second);
    assert_eq!(summary.outcome, JobOutcome::Exhausted);
    assert_eq!(sink.sessions.load(Ordering::SeqCst), 2);
    assert_eq!(sink.ended.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.live.counts(), LiveCounts::default());
    assert_eq!(ctx.live.analytics().peak, 0);
    assert_eq!(supervisor.status().phase, JobPhase::Idle);
}

#[test]
fn shutdown_stops_running_job_promptly() {
    let factory = Arc::new(TestFactory::new(nobody()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);
    let supervisor = JobSupervisor::new(ctx.clone());

    supervisor.submit(PathBuf::from("endless")).unwrap();
    assert!(wait_until(|| ctx.live.frame_index() > 3));
    let t0 = Instant::now();
    supervisor.shutdown();
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert_eq!(supervisor.status().phase, JobPhase::Idle);
    assert_eq!(sink.ended.load(Ordering::SeqCst), 1);
}

#[test]
fn submit_during_wait_still_joins_the_running_job() {
    let factory = Arc::new(TestFactory::new(nobody()));
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory, sink.clone(), 1);
    let supervisor = JobSupervisor::new(ctx.clone());

    let first = supervisor.submit(PathBuf::from("endless")).unwrap();
    assert!(wait_until(|| ctx.live.frame_index() > 2));

    thread::scope(|s| {
        let waiter = s.spawn(|| supervisor.wait());
        thread::sleep(Duration::from_millis(30));

        let second = supervisor.submit(PathBuf::from("frames-2")).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(sink.ended.load(Ordering::SeqCst), 1);

        let summary = waiter.join().unwrap().unwrap();
        assert_eq!(summary.job_id, second);
        assert_eq!(summary.outcome, JobOutcome::Exhausted);
    });
    assert_eq!(sink.sessions.load(Ordering::SeqCst), 2);
    assert_eq!(sink.ended.load(Ordering::SeqCst), 2);
}

#[test]
fn status_reports_stopping_while_submit_joins() {
    let mut factory = TestFactory::new(nobody());
    factory.hook = Some(Arc::new(|_| thread::sleep(Duration::from_millis(150))));
    let factory = Arc::new(factory);
    let sink = Arc::new(RecordingSink::default());
    let ctx = context(factory.clone(), sink, 1);
    let supervisor = JobSupervisor::new(ctx);

    supervisor.submit(PathBuf::from("endless")).unwrap();
    assert!(wait_until(|| !factory.frames_seen().is_empty()));
    assert_eq!(supervisor.status().phase, JobPhase::Running);

    thread::scope(|s| {
        let restart = s.spawn(|| supervisor.submit(PathBuf::from("frames-0")));
        assert!(wait_until(|| supervisor.status().phase == JobPhase::Stopping));
        restart.join().unwrap().unwrap();
    });
    assert!(wait_until(|| supervisor.status().phase == JobPhase::Idle));
}
