use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// A decoded video stream. `Ok(None)` is end of stream; `Err` is a hiccup the
/// caller may skip over.
pub trait FrameSource: Send {
    fn info(&self) -> FrameInfo;
    fn read(&mut self) -> Result<Option<RgbImage>>;
}

/// Decodes through an `ffmpeg` child process emitting raw rgb24 on stdout.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    info: FrameInfo,
    frame_bytes: usize,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("Could not open video: {} does not exist", path.display());
        }
        let info = probe(path)?;
        if info.width == 0 || info.height == 0 {
            bail!("Could not open video: zero-sized stream in {}", path.display());
        }

        let mut child = Command::new("ffmpeg")
            .args(["-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("spawning ffmpeg")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        Ok(Self {
            child,
            stdout,
            info,
            frame_bytes: info.width as usize * info.height as usize * 3,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> FrameInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.frame_bytes];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            // a truncated trailing frame is treated as the end
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("frame buffer size mismatch"))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn probe(path: &Path) -> Result<FrameInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .context("running ffprobe")?;
    if !output.status.success() {
        bail!(
            "Could not open video {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `width,height,num/den` as printed by ffprobe's csv writer.
pub fn parse_probe(text: &str) -> Result<FrameInfo> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let mut parts = line.split(',');
    let width = parts
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| anyhow!("bad width in probe output: {line}"))?;
    let height = parts
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| anyhow!("bad height in probe output: {line}"))?;
    let fps = parts.next().map(parse_rate).unwrap_or(0.0);
    Ok(FrameInfo { width, height, fps })
}

fn parse_rate(raw: &str) -> f64 {
    let raw = raw.trim();
    match raw.split_once('/') {
        Some((n, d)) => {
            let n = n.parse::<f64>().unwrap_or(0.0);
            let d = d.parse::<f64>().unwrap_or(0.0);
            if d > 0.0 {
                n / d
            } else {
                0.0
            }
        }
        None => raw.parse::<f64>().unwrap_or(0.0),
    }
}

pub fn source_display_name(source: &Path) -> String {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| source.to_string_lossy().to_string())
}

/// Reduce an uploaded filename to a bare, filesystem-safe component.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
