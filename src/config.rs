use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::warn;

use crate::error::SettingsError;
use crate::state::{
    DEFAULT_CONFIDENCE, DEFAULT_MAX_OCCUPANCY, DEFAULT_SAMPLE_RATE, GRID_COLS, GRID_ROWS,
    HEATMAP_DECAY, HIGH_THRESH, JPEG_QUALITY, LEDGER_EVICT_AFTER, MATCH_THRESH, MAX_DENSITY,
    MAX_READ_ERRORS, PERSON_CLASS, SYNC_INTERVAL_SECS, SYNC_TIMEOUT_SECS, TRACK_BUFFER,
    TRACK_FRAME_RATE, TRACK_THRESH,
};

// ================== LIVE CONFIG ==================

/// The triple the frame loop reads on every processed frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub confidence: f32,
    pub sample_rate: u32,
    pub max_occupancy: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_occupancy: DEFAULT_MAX_OCCUPANCY,
        }
    }
}

impl DetectionSettings {
    /// Frame-skip divisor; a stored zero still processes every frame.
    pub fn stride(&self) -> u64 {
        self.sample_rate.max(1) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertChannels {
    pub email: bool,
    pub sms: bool,
    pub webhook: bool,
}

impl Default for AlertChannels {
    fn default() -> Self {
        Self {
            email: true,
            sms: false,
            webhook: false,
        }
    }
}

impl AlertChannels {
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.email {
            out.push("email");
        }
        if self.sms {
            out.push("sms");
        }
        if self.webhook {
            out.push("webhook");
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    #[serde(flatten)]
    pub detection: DetectionSettings,
    pub alerts: AlertChannels,
}

/// Fields recovered from a settings pull. Absent fields keep their old value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SettingsPatch {
    pub confidence: Option<f32>,
    pub sample_rate: Option<u32>,
    pub max_occupancy: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.confidence.is_none() && self.sample_rate.is_none() && self.max_occupancy.is_none()
    }
}

/// Body of a direct settings update. All three detection fields are required.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub confidence: Option<Value>,
    #[serde(alias = "fps")]
    pub sample_rate: Option<Value>,
    #[serde(alias = "max_people")]
    pub max_occupancy: Option<Value>,
    pub alerts: Option<AlertChannels>,
}

impl SettingsUpdate {
    pub fn validate(&self) -> Result<DetectionSettings, SettingsError> {
        let confidence = self
            .confidence
            .as_ref()
            .ok_or(SettingsError::Missing("confidence"))
            .and_then(parse_confidence)?;
        let sample_rate = self
            .sample_rate
            .as_ref()
            .ok_or(SettingsError::Missing("sample_rate"))
            .and_then(parse_sample_rate)?;
        let max_occupancy = self
            .max_occupancy
            .as_ref()
            .ok_or(SettingsError::Missing("max_occupancy"))
            .and_then(|v| parse_count(v, "max_occupancy"))?;
        Ok(DetectionSettings {
            confidence,
            sample_rate,
            max_occupancy,
        })
    }
}

pub fn parse_confidence(v: &Value) -> Result<f32, SettingsError> {
    let raw = value_as_f64(v).ok_or_else(|| SettingsError::Invalid {
        field: "confidence",
        reason: format!("not a number: {v}"),
    })?;
    if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
        return Err(SettingsError::Invalid {
            field: "confidence",
            reason: format!("{raw} outside [0, 1]"),
        });
    }
    Ok(raw as f32)
}

pub fn parse_sample_rate(v: &Value) -> Result<u32, SettingsError> {
    let rate = parse_count(v, "sample_rate")?;
    if rate == 0 {
        return Err(SettingsError::Invalid {
            field: "sample_rate",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(rate)
}

pub fn parse_count(v: &Value, field: &'static str) -> Result<u32, SettingsError> {
    let raw = value_as_f64(v).ok_or_else(|| SettingsError::Invalid {
        field,
        reason: format!("not a number: {v}"),
    })?;
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 || raw > u32::MAX as f64 {
        return Err(SettingsError::Invalid {
            field,
            reason: format!("{raw} is not a non-negative integer"),
        });
    }
    Ok(raw as u32)
}

/// Settings services hand out numbers both as JSON numbers and as strings.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ================== CONFIG STORE ==================

/// Process-wide live config. Every write replaces the whole record under the
/// lock, so readers never see a half-applied update.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: RwLock<LiveConfig>,
}

impl ConfigStore {
    pub fn new(initial: LiveConfig) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> LiveConfig {
        *self.inner.read()
    }

    pub fn detection(&self) -> DetectionSettings {
        self.inner.read().detection
    }

    pub fn alerts(&self) -> AlertChannels {
        self.inner.read().alerts
    }

    /// Push-style update: the full detection triple, optionally the alert toggles.
    pub fn set(&self, detection: DetectionSettings, alerts: Option<AlertChannels>) -> LiveConfig {
        let mut guard = self.inner.write();
        guard.detection = detection;
        if let Some(alerts) = alerts {
            guard.alerts = alerts;
        }
        *guard
    }

    pub fn update(&self, update: &SettingsUpdate) -> Result<LiveConfig, SettingsError> {
        let detection = update.validate()?;
        Ok(self.set(detection, update.alerts))
    }

    /// Pull-style refresh: apply only the fields that were recovered.
    pub fn apply(&self, patch: SettingsPatch) -> LiveConfig {
        let mut guard = self.inner.write();
        if let Some(c) = patch.confidence {
            guard.detection.confidence = c;
        }
        if let Some(r) = patch.sample_rate {
            guard.detection.sample_rate = r;
        }
        if let Some(m) = patch.max_occupancy {
            guard.detection.max_occupancy = m;
        }
        *guard
    }
}

// ================== SERVICE CONFIG (YAML) ==================

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub settings: SyncConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub heatmap: HeatmapConfig,
    pub job: JobConfig,
    pub persistence: PersistenceConfig,
    pub defaults: LiveConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub upload_dir: PathBuf,
    pub max_upload_mb: usize,
    pub stream_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_mb: 512,
            stream_interval_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub url: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://127.0.0.1:5005/api/settings/grouped".to_string(),
            interval_secs: SYNC_INTERVAL_SECS,
            timeout_secs: SYNC_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub target_class: i64,
    /// Quality of the JPEG posted to the detection service.
    pub request_jpeg_quality: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8500/detect".to_string(),
            timeout_ms: 2000,
            target_class: PERSON_CLASS,
            request_jpeg_quality: JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub frame_rate: usize,
    pub track_buffer: usize,
    pub track_thresh: f32,
    pub high_thresh: f32,
    pub match_thresh: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            frame_rate: TRACK_FRAME_RATE,
            track_buffer: TRACK_BUFFER,
            track_thresh: TRACK_THRESH,
            high_thresh: HIGH_THRESH,
            match_thresh: MATCH_THRESH,
        }
    }
}

impl TrackerConfig {
    /// Tracker updates a lost track survives before its id is retired.
    pub fn max_time_lost(&self) -> u64 {
        (self.frame_rate.max(1) as f64 / 30.0 * self.track_buffer as f64) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    /// Floor every cell after decay+accumulate.
    Whole,
    Continuous,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    pub rows: usize,
    pub cols: usize,
    pub decay: f32,
    pub max_density: f32,
    pub quantization: Quantization,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            rows: GRID_ROWS,
            cols: GRID_COLS,
            decay: HEATMAP_DECAY,
            max_density: MAX_DENSITY,
            quantization: Quantization::Whole,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub evict_after: u64,
    pub max_read_errors: u32,
    /// Quality of the annotated JPEG published to viewers.
    pub stream_jpeg_quality: u8,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            evict_after: LEDGER_EVICT_AFTER,
            max_read_errors: MAX_READ_ERRORS,
            stream_jpeg_quality: JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub queue: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/occupancy.db"),
            queue: 64,
        }
    }
}

impl AppConfig {
    /// Missing file means defaults; a present but broken file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(raw)?;
        Ok(cfg.normalized())
    }

    /// The ledger must not forget an id the tracker can still hand back,
    /// or a returning person is counted twice.
    pub fn normalized(mut self) -> Self {
        let floor = self.tracker.max_time_lost();
        if self.job.evict_after < floor {
            warn!(
                evict_after = self.job.evict_after,
                tracker_lost = floor,
                "job.evict_after raised to the tracker's lost-track lifetime"
            );
            self.job.evict_after = floor;
        }
        self
    }
}
