//! ffmpeg-backed stream connection and clip writer.
//!
//! Streams are probed with `ffprobe` for geometry and native frame rate, then
//! decoded by an `ffmpeg` child process that writes raw RGB24 frames to its
//! stdout.  Clips are encoded by a second `ffmpeg` child fed through stdin.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, info, warn};

use vigil_common::config::output_file_name;

use crate::source::{
    ClipWriter, ClipWriterFactory, FrameReader, StreamConnector, StreamError, StreamInfo,
};

/// Used when the stream does not report a usable frame rate.
pub const FALLBACK_FPS: f64 = 25.0;

/// Socket / IO timeout for network sources, in microseconds.
const NET_TIMEOUT_US: &str = "30000000";

/// Input options that keep a network source from stalling the reader.
fn transport_args(url: &str) -> Vec<&'static str> {
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        vec![
            "-rtsp_transport",
            "tcp",
            "-timeout",
            NET_TIMEOUT_US,
            "-max_delay",
            "5000000",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
        ]
    } else if url.contains("://") {
        vec!["-rw_timeout", NET_TIMEOUT_US]
    } else {
        vec![]
    }
}

// ── probe ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Parse an ffprobe rational like `30000/1001`.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    let fps = num / den;
    (fps.is_finite() && fps > 0.0 && fps <= 1000.0).then_some(fps)
}

fn parse_probe(url: &str, json: &[u8]) -> Result<StreamInfo, StreamError> {
    let probe_err = |reason: String| StreamError::Probe {
        url: url.to_string(),
        reason,
    };
    let out: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| probe_err(format!("bad ffprobe output: {e}")))?;
    let stream = out
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| probe_err("no video stream".into()))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(probe_err("unknown frame size".into())),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(FALLBACK_FPS);
    Ok(StreamInfo { width, height, fps })
}

fn probe(url: &str) -> Result<StreamInfo, StreamError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height,r_frame_rate,avg_frame_rate"])
        .args(["-of", "json"])
        .args(transport_args(url))
        .arg(url)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StreamError::Probe {
            url: url.to_string(),
            reason: format!("cannot run ffprobe: {e}"),
        })?;
    if !output.status.success() {
        return Err(StreamError::Probe {
            url: url.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_probe(url, &output.stdout)
}

/// Log a child's stderr in a background thread so the pipe never fills up.
fn drain_stderr(child: &mut Child, label: String) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    std::thread::Builder::new()
        .name(format!("{label}-stderr"))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(l) if l.is_empty() => {}
                    Ok(l) => warn!("[{label}] {l}"),
                    Err(_) => break,
                }
            }
            debug!("{label} stderr stream ended");
        })
        .ok();
}

// ── decoding ─────────────────────────────────────────────────────────────

/// Opens streams through `ffprobe` + `ffmpeg`.
#[derive(Debug, Default, Clone)]
pub struct FfmpegConnector;

impl StreamConnector for FfmpegConnector {
    fn connect(&mut self, url: &str) -> Result<Box<dyn FrameReader>, StreamError> {
        let info = probe(url)?;

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        cmd.args(transport_args(url));
        cmd.args(["-i", url, "-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| StreamError::Connect {
            url: url.to_string(),
            reason: format!("cannot spawn ffmpeg: {e}"),
        })?;
        drain_stderr(&mut child, "ffmpeg".into());
        let stdout = child.stdout.take().ok_or_else(|| StreamError::Connect {
            url: url.to_string(),
            reason: "ffmpeg stdout unavailable".into(),
        })?;

        info!(
            "Decoding {}x{} @ {:.2} fps (pid={})",
            info.width,
            info.height,
            info.fps,
            child.id()
        );
        Ok(Box::new(FfmpegReader {
            child: Some(child),
            stdout,
            info,
        }))
    }
}

struct FfmpegReader {
    child: Option<Child>,
    stdout: ChildStdout,
    info: StreamInfo,
}

impl FrameReader for FfmpegReader {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<RgbImage, StreamError> {
        let len = self.info.width as usize * self.info.height as usize * 3;
        let mut buf = vec![0u8; len];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(StreamError::EndOfStream),
            Err(e) => return Err(e.into()),
        }
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .ok_or_else(|| StreamError::Read("short frame buffer".into()))
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        self.close();
    }
}

// ── clip writing ─────────────────────────────────────────────────────────

/// Writes clips as `<dir>/<source>_<YYYYmmdd_HHMMSS>.mp4`.
#[derive(Debug, Clone)]
pub struct FfmpegClipWriters {
    dir: PathBuf,
}

impl FfmpegClipWriters {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ClipWriterFactory for FfmpegClipWriters {
    fn open(
        &mut self,
        source: &str,
        started: DateTime<Utc>,
        info: StreamInfo,
    ) -> Result<Box<dyn ClipWriter>, StreamError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(output_file_name(source, started, false, "mp4"));

        let size = format!("{}x{}", info.width, info.height);
        let rate = format!("{:.3}", info.fps);
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size, "-r", &rate])
            .args(["-i", "-", "-c:v", "mpeg4", "-q:v", "5", "-pix_fmt", "yuv420p"])
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StreamError::Writer(format!("cannot spawn ffmpeg: {e}")))?;
        drain_stderr(&mut child, "ffmpeg-clip".into());
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::Writer("ffmpeg stdin unavailable".into()))?;

        debug!("Clip writer opened: {}", path.display());
        Ok(Box::new(FfmpegClipWriter {
            child,
            stdin: Some(stdin),
            path,
            width: info.width,
            height: info.height,
        }))
    }
}

struct FfmpegClipWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
    width: u32,
    height: u32,
}

impl ClipWriter for FfmpegClipWriter {
    fn write(&mut self, frame: &RgbImage) -> Result<(), StreamError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| StreamError::Writer("writer already closed".into()))?;
        if frame.dimensions() == (self.width, self.height) {
            stdin.write_all(frame.as_raw())?;
        } else {
            let resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            stdin.write_all(resized.as_raw())?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf, StreamError> {
        // closing stdin lets ffmpeg flush the trailer
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if status.success() {
            Ok(std::mem::take(&mut self.path))
        } else {
            Err(StreamError::Writer(format!(
                "ffmpeg exited with {status} for {}",
                self.path.display()
            )))
        }
    }
}

impl Drop for FfmpegClipWriter {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.wait();
        }
    }
}
