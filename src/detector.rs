use anyhow::{anyhow, Context, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use serde::Deserialize;
use std::time::Duration;

use crate::config::DetectorConfig;
use crate::state::BBox;
use crate::tracker::TrackerInput;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub class_id: i64,
    pub confidence: f32,
}

pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbImage, confidence: f32) -> Result<Vec<RawDetection>>;
}

/// Keep the target class, drop degenerate boxes, hand the rest to the tracker as ltwh.
pub fn select_targets(dets: &[RawDetection], target_class: i64) -> Vec<TrackerInput> {
    dets.iter()
        .filter(|d| d.class_id == target_class)
        .filter(|d| d.bbox.x2 > d.bbox.x1 && d.bbox.y2 > d.bbox.y1)
        .map(|d| TrackerInput {
            ltwh: d.bbox.to_ltwh(),
            confidence: d.confidence,
            class_id: d.class_id,
        })
        .collect()
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

// ================== HTTP DETECTOR ==================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectReply {
    List(Vec<WireDetection>),
    Wrapped { detections: Vec<WireDetection> },
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    bbox: [f32; 4],
    #[serde(alias = "class", alias = "cls")]
    class_id: i64,
    #[serde(alias = "conf", alias = "score")]
    confidence: f32,
}

impl From<WireDetection> for RawDetection {
    fn from(w: WireDetection) -> Self {
        let [x1, y1, x2, y2] = w.bbox;
        RawDetection {
            bbox: BBox { x1, y1, x2, y2 },
            class_id: w.class_id,
            confidence: w.confidence,
        }
    }
}

pub fn parse_reply(body: &str) -> Result<Vec<RawDetection>> {
    let reply: DetectReply = serde_json::from_str(body).context("decoding detector reply")?;
    let list = match reply {
        DetectReply::List(list) => list,
        DetectReply::Wrapped { detections } => detections,
    };
    Ok(list.into_iter().map(RawDetection::from).collect())
}

/// Ships each frame as JPEG to an inference service and reads back xyxy boxes.
pub struct HttpDetector {
    agent: ureq::Agent,
    url: String,
    jpeg_quality: u8,
}

impl HttpDetector {
    pub fn new(cfg: &DetectorConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1)))
            .build();
        Self {
            agent,
            url: cfg.url.clone(),
            jpeg_quality: cfg.request_jpeg_quality,
        }
    }
}

impl Detector for HttpDetector {
    fn detect(&mut self, frame: &RgbImage, confidence: f32) -> Result<Vec<RawDetection>> {
        let jpeg = encode_jpeg(frame, self.jpeg_quality)?;
        let body = self
            .agent
            .post(&self.url)
            .query("conf", &format!("{confidence:.3}"))
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("detector request to {}", self.url))?
            .into_string()?;
        parse_reply(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class_id: i64, x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            bbox: BBox { x1, y1, x2, y2 },
            class_id,
            confidence: 0.8,
        }
    }

    #[test]
    fn only_target_class_reaches_tracker() {
        let dets = [
            raw(0, 10.0, 20.0, 50.0, 120.0),
            raw(2, 0.0, 0.0, 10.0, 10.0),
            raw(0, 30.0, 30.0, 30.0, 90.0),
        ];
        let out = select_targets(&dets, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ltwh, [10.0, 20.0, 40.0, 100.0]);
    }

    #[test]
    fn reply_accepts_plain_and_wrapped_lists() {
        let plain = parse_reply(r#"[{"bbox":[1,2,3,4],"class_id":0,"confidence":0.5}]"#).unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].bbox.y2, 4.0);

        let wrapped =
            parse_reply(r#"{"detections":[{"bbox":[1,2,3,4],"cls":1,"score":0.9}]}"#).unwrap();
        assert_eq!(wrapped[0].class_id, 1);
        assert!(parse_reply("not json").is_err());
    }

    #[test]
    fn frames_encode_to_jpeg() {
        let frame = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
        let jpeg = encode_jpeg(&frame, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
