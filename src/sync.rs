use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{
    parse_confidence, parse_count, parse_sample_rate, ConfigStore, LiveConfig, SettingsPatch,
    SyncConfig,
};

pub const KEY_CONFIDENCE: &str = "detection_confidence_threshold";
pub const KEY_SAMPLE_RATE: &str = "detection_fps";
pub const KEY_MAX_OCCUPANCY: &str = "max_people_count";

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// Remote, authoritative settings. One call returns every group flattened.
pub trait SettingsSource: Send + Sync {
    fn fetch_grouped(&self) -> Result<Vec<SettingEntry>>;
}

#[derive(Debug, Deserialize)]
struct GroupedReply {
    data: BTreeMap<String, Vec<SettingEntry>>,
}

pub fn flatten_grouped(body: &str) -> Result<Vec<SettingEntry>> {
    let reply: GroupedReply = serde_json::from_str(body).context("decoding grouped settings")?;
    Ok(reply.data.into_values().flatten().collect())
}

pub struct HttpSettingsSource {
    agent: ureq::Agent,
    url: String,
}

impl HttpSettingsSource {
    pub fn new(cfg: &SyncConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(cfg.timeout()).build();
        Self {
            agent,
            url: cfg.url.clone(),
        }
    }
}

impl SettingsSource for HttpSettingsSource {
    fn fetch_grouped(&self) -> Result<Vec<SettingEntry>> {
        let body = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|err| anyhow!("settings fetch from {} failed: {err}", self.url))?
            .into_string()?;
        flatten_grouped(&body)
    }
}

/// Map recognised keys onto a patch. Bad values are skipped one by one.
pub fn translate(entries: &[SettingEntry]) -> SettingsPatch {
    let mut patch = SettingsPatch::default();
    for entry in entries {
        match entry.key.as_str() {
            KEY_CONFIDENCE => match parse_confidence(&entry.value) {
                Ok(v) => patch.confidence = Some(v),
                Err(err) => warn!(key = %entry.key, "ignoring pulled setting: {err}"),
            },
            KEY_SAMPLE_RATE => match parse_sample_rate(&entry.value) {
                Ok(v) => patch.sample_rate = Some(v),
                Err(err) => warn!(key = %entry.key, "ignoring pulled setting: {err}"),
            },
            KEY_MAX_OCCUPANCY => match parse_count(&entry.value, "max_occupancy") {
                Ok(v) => patch.max_occupancy = Some(v),
                Err(err) => warn!(key = %entry.key, "ignoring pulled setting: {err}"),
            },
            _ => {}
        }
    }
    patch
}

/// One pull. A failed fetch leaves the store untouched.
pub fn sync_once(source: &dyn SettingsSource, store: &ConfigStore) -> Result<LiveConfig> {
    let entries = source.fetch_grouped()?;
    let patch = translate(&entries);
    if patch.is_empty() {
        debug!("settings pull carried no recognised keys");
        return Ok(store.get());
    }
    let before = store.get();
    let after = store.apply(patch);
    if before != after {
        info!(
            confidence = after.detection.confidence,
            sample_rate = after.detection.sample_rate,
            max_occupancy = after.detection.max_occupancy,
            "live config updated from settings service"
        );
    }
    Ok(after)
}

pub struct SyncWorker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl SyncWorker {
    pub fn spawn(source: Arc<dyn SettingsSource>, store: Arc<ConfigStore>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let join = thread::spawn(move || {
            info!(every = ?interval, "settings sync started");
            loop {
                if let Err(err) = sync_once(source.as_ref(), &store) {
                    warn!("settings sync failed: {err:#}");
                }
                if sleep_unless_stopped(&stop_thread, interval) {
                    break;
                }
            }
            info!("settings sync stopped");
        });
        Self { stop, join }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.join.join().is_err() {
            warn!("settings sync thread panicked");
        }
    }
}

/// Sleep in short slices; returns true when stopped.
fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(slice.min(deadline - now));
    }
}
