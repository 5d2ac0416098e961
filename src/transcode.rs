// ABOUTME: Media transcoding pipeline — format detection, codec-aware conversion, size-bound compression
// ABOUTME: Single bounded queue; each file is panic-isolated so one bad input never sinks the pipeline

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Settings;
use crate::envelope::{Envelope, FileAttachment};

/// Target output size for a transcoded MMS attachment. Carriers vary; this
/// mirrors the conservative end of typical MMSC limits.
pub const TARGET_OUTPUT_SIZE: u64 = 300 * 1024;

const JPEG_QUALITY_LADDER: [u8; 7] = [85, 70, 55, 40, 25, 15, 5];
const RESIZE_LADDER: [f32; 5] = [1.0, 0.75, 0.5, 0.35, 0.25];

#[derive(Debug, Error, Clone)]
pub enum TranscodeError {
    #[error("file is too large to process ({size} bytes, max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("animated GIF exceeds the size limit for pass-through ({size} bytes, max {max} bytes)")]
    GIFTooLarge { size: u64, max: u64 },

    #[error("could not compress file to an acceptable size")]
    CompressionFailed,

    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),

    #[error("internal transcoder error: {0}")]
    Internal(String),
}

impl TranscodeError {
    /// The message synthesized back to the sender as an SMS.
    pub fn user_message(&self) -> String {
        match self {
            TranscodeError::FileTooLarge { .. } => {
                "Your media could not be sent: the file is too large.".to_string()
            }
            TranscodeError::GIFTooLarge { .. } => {
                "Your media could not be sent: the animated image is too large.".to_string()
            }
            TranscodeError::CompressionFailed => {
                "Your media could not be sent: it could not be compressed to an acceptable size."
                    .to_string()
            }
            TranscodeError::UnsupportedFormat(fmt) => {
                format!("Your media could not be sent: unsupported format ({fmt}).")
            }
            TranscodeError::Internal(_) => {
                "Your media could not be sent due to an internal error.".to_string()
            }
        }
    }
}

/// External codec contract for video/audio transcodes:
/// "invoke a codec-aware transcode". The default implementation shells out
/// to `ffmpeg`, bounded by a temp-file budget under `TRANSCODE_TEMP_PATH`.
pub trait MediaCodec: Send + Sync {
    fn transcode_video(&self, input: &[u8], temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError>;
    fn transcode_audio(&self, input: &[u8], temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError>;
}

/// `ffmpeg`-backed codec. Every invocation writes its input to a fresh
/// tempfile under `temp_dir`, invokes `ffmpeg` with the carrier-compatible
/// target parameters from spec §4.2, and guarantees the tempfiles are
/// cleaned up (RAII via `tempfile::NamedTempFile`) even on failure.
pub struct FfmpegCodec;

impl FfmpegCodec {
    fn run(&self, input: &[u8], temp_dir: &std::path::Path, args: &[&str], out_ext: &str) -> Result<Vec<u8>, TranscodeError> {
        let in_file = tempfile::Builder::new()
            .prefix("gw-in-")
            .tempfile_in(temp_dir)
            .map_err(|e| TranscodeError::Internal(e.to_string()))?;
        std::fs::write(in_file.path(), input).map_err(|e| TranscodeError::Internal(e.to_string()))?;

        let out_path = temp_dir.join(format!("gw-out-{}.{out_ext}", uuid::Uuid::new_v4()));

        let status = std::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(in_file.path())
            .args(args)
            .arg(&out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let cleanup = || {
            let _ = std::fs::remove_file(&out_path);
        };

        match status {
            Ok(s) if s.success() => {
                let bytes = std::fs::read(&out_path).map_err(|e| {
                    cleanup();
                    TranscodeError::Internal(e.to_string())
                })?;
                cleanup();
                Ok(bytes)
            }
            Ok(_) => {
                cleanup();
                Err(TranscodeError::CompressionFailed)
            }
            Err(e) => {
                cleanup();
                Err(TranscodeError::Internal(format!("ffmpeg not runnable: {e}")))
            }
        }
    }
}

impl MediaCodec for FfmpegCodec {
    fn transcode_video(&self, input: &[u8], temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError> {
        // 176x144, ~128 kbps video, ~12 FPS, narrowband mono 8kHz audio.
        self.run(
            input,
            temp_dir,
            &[
                "-vf", "scale=176:144", "-b:v", "128k", "-r", "12",
                "-ac", "1", "-ar", "8000", "-b:a", "12k",
            ],
            "3gp",
        )
    }

    fn transcode_audio(&self, input: &[u8], temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError> {
        // standard lossy mono, ~128 kbps, 44.1 kHz.
        self.run(
            input,
            temp_dir,
            &["-ac", "1", "-ar", "44100", "-b:a", "128k"],
            "mp3",
        )
    }
}

/// Detects the MIME family of raw bytes by content sniffing when the
/// declared type is generic/absent.
fn sniff_mime(bytes: &[u8], declared: &str) -> String {
    if !declared.is_empty() && declared != "application/octet-stream" {
        return declared.to_string();
    }
    if let Ok(fmt) = image::guess_format(bytes) {
        return match fmt {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            _ => "application/octet-stream",
        }
        .to_string();
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        return "audio/mpeg".to_string();
    }
    if bytes.len() > 8 && &bytes[4..8] == b"ftyp" {
        return "video/mp4".to_string();
    }
    mime_guess::from_path("unknown").first_or_octet_stream().to_string()
}

fn is_base64_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn count_gif_frames(bytes: &[u8]) -> usize {
    use image::AnimationDecoder;
    match image::codecs::gif::GifDecoder::new(Cursor::new(bytes)) {
        Ok(decoder) => decoder.into_frames().count(),
        Err(_) => 1,
    }
}

fn jpeg_encode(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    img.write_with_encoder(encoder)
        .map_err(|e| TranscodeError::Internal(e.to_string()))?;
    Ok(out)
}

fn png_encode(img: &DynamicImage) -> Result<Vec<u8>, TranscodeError> {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| TranscodeError::Internal(e.to_string()))?;
    Ok(out)
}

fn resize(img: &DynamicImage, factor: f32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let nw = ((w as f32) * factor).max(1.0) as u32;
    let nh = ((h as f32) * factor).max(1.0) as u32;
    img.resize(nw, nh, image::imageops::FilterType::Lanczos3)
}

/// Quality-then-resize ladder shared by the JPEG and PNG-fallback branches
///.
fn jpeg_ladder(img: &DynamicImage, target: u64) -> Result<Vec<u8>, TranscodeError> {
    for factor in RESIZE_LADDER {
        let candidate = if factor == 1.0 { img.clone() } else { resize(img, factor) };
        for quality in JPEG_QUALITY_LADDER {
            let encoded = jpeg_encode(&candidate, quality)?;
            if (encoded.len() as u64) <= target {
                return Ok(encoded);
            }
        }
    }
    Err(TranscodeError::CompressionFailed)
}

/// Per-file pipeline. Returns the processed file with
/// a fresh UUID filename and the format-appropriate extension.
pub fn process_file(
    file: &FileAttachment,
    settings: &Settings,
    codec: &dyn MediaCodec,
) -> Result<FileAttachment, TranscodeError> {
    // Step 1: application/smil passes through unchanged.
    if file.mime_type == "application/smil" {
        return Ok(file.clone());
    }

    // Step 2: decode base64-text payloads once.
    let raw: Vec<u8> = if is_base64_text(&file.bytes) {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &file.bytes)
            .unwrap_or_else(|_| file.bytes.clone())
    } else {
        file.bytes.clone()
    };

    // Step 4 (ordering intentional: reject by real size before further work).
    if raw.len() as u64 > settings.transcode_max_input_size {
        return Err(TranscodeError::FileTooLarge {
            size: raw.len() as u64,
            max: settings.transcode_max_input_size,
        });
    }

    // Step 3: content-sniff a generic/absent MIME.
    let mime = sniff_mime(&raw, &file.mime_type);

    // Step 5: animated GIF pass-or-reject.
    if mime == "image/gif" && count_gif_frames(&raw) > 1 {
        if raw.len() as u64 > settings.transcode_gif_pass_limit {
            return Err(TranscodeError::GIFTooLarge {
                size: raw.len() as u64,
                max: settings.transcode_gif_pass_limit,
            });
        }
        return Ok(FileAttachment::new(fresh_name("gif"), "image/gif", raw));
    }

    // Step 6: branch by MIME family.
    let (out_bytes, out_mime, ext) = match mime.as_str() {
        "image/jpeg" => {
            let img = image::load_from_memory(&raw)
                .map_err(|e| TranscodeError::UnsupportedFormat(e.to_string()))?;
            if raw.len() as u64 <= TARGET_OUTPUT_SIZE {
                (raw, "image/jpeg".to_string(), "jpg")
            } else {
                (jpeg_ladder(&img, TARGET_OUTPUT_SIZE)?, "image/jpeg".to_string(), "jpg")
            }
        }
        "image/png" => {
            let img = image::load_from_memory(&raw)
                .map_err(|e| TranscodeError::UnsupportedFormat(e.to_string()))?;
            let encoded = png_encode(&img)?;
            if (encoded.len() as u64) <= TARGET_OUTPUT_SIZE {
                (encoded, "image/png".to_string(), "png")
            } else {
                // fall back to the JPEG ladder; format may change.
                (jpeg_ladder(&img, TARGET_OUTPUT_SIZE)?, "image/jpeg".to_string(), "jpg")
            }
        }
        other if other.starts_with("image/") => {
            let img = image::load_from_memory(&raw)
                .map_err(|e| TranscodeError::UnsupportedFormat(e.to_string()))?;
            let png = png_encode(&img)?;
            if (png.len() as u64) <= TARGET_OUTPUT_SIZE {
                (png, "image/png".to_string(), "png")
            } else {
                (jpeg_ladder(&img, TARGET_OUTPUT_SIZE)?, "image/jpeg".to_string(), "jpg")
            }
        }
        other if other.starts_with("video/") => {
            let transcoded = codec.transcode_video(&raw, &settings.transcode_temp_path)?;
            (transcoded, "video/3gpp".to_string(), "3gp")
        }
        other if other.starts_with("audio/") => {
            let transcoded = codec.transcode_audio(&raw, &settings.transcode_temp_path)?;
            (transcoded, "audio/mpeg".to_string(), "mp3")
        }
        _ => {
            if raw.len() as u64 <= TARGET_OUTPUT_SIZE {
                (raw, mime, "bin")
            } else {
                return Err(TranscodeError::CompressionFailed);
            }
        }
    };

    let mut out = FileAttachment::new(fresh_name(ext), out_mime, out_bytes);
    let _ = out.base64(); // step 7: re-encode base64 for downstream transport.
    Ok(out)
}

fn fresh_name(ext: &str) -> String {
    format!("{}.{ext}", uuid::Uuid::new_v4())
}

/// Process every file in `envelope` through `process_file`. On the first
/// failure, returns the classifying error alongside the original envelope
/// so the caller (the pipeline below, or the Router) can synthesize the
/// sender notification spec §4.2 requires.
pub fn transcode_envelope(
    envelope: &Envelope,
    settings: &Settings,
    codec: &dyn MediaCodec,
) -> Result<Vec<FileAttachment>, TranscodeError> {
    envelope
        .files
        .iter()
        .map(|f| process_file(f, settings, codec))
        .collect()
}

/// A single bounded queue absorbing backpressure for the transcode stage
///. Each job runs on a blocking thread,
/// panic-isolated
/// so a single bad input never sinks the pipeline.
pub struct TranscodePipeline {
    tx: mpsc::Sender<Job>,
}

struct Job {
    envelope: Envelope,
    reply: oneshot::Sender<Result<Vec<FileAttachment>, TranscodeError>>,
}

impl TranscodePipeline {
    pub fn spawn(settings: Arc<Settings>, codec: Arc<dyn MediaCodec>, queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_depth);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let settings = Arc::clone(&settings);
                let codec = Arc::clone(&codec);
                let result = tokio::task::spawn_blocking(move || {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        transcode_envelope(&job.envelope, &settings, codec.as_ref())
                    }))
                    .unwrap_or_else(|_| {
                        Err(TranscodeError::Internal(
                            "transcode worker panicked".to_string(),
                        ))
                    })
                })
                .await
                .unwrap_or_else(|e| Err(TranscodeError::Internal(e.to_string())));
                let _ = job.reply.send(result);
            }
        });
        TranscodePipeline { tx }
    }

    pub async fn submit(&self, envelope: Envelope) -> Result<Vec<FileAttachment>, TranscodeError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Job { envelope, reply })
            .await
            .is_err()
        {
            return Err(TranscodeError::Internal("transcode pipeline closed".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(TranscodeError::Internal("transcode worker dropped".into())))
    }
}

/// Test-only no-op codec so image-only unit tests don't require `ffmpeg`.
pub struct NullCodec;
impl MediaCodec for NullCodec {
    fn transcode_video(&self, _input: &[u8], _temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError> {
        Err(TranscodeError::UnsupportedFormat("video (no codec configured)".into()))
    }
    fn transcode_audio(&self, _input: &[u8], _temp_dir: &std::path::Path) -> Result<Vec<u8>, TranscodeError> {
        Err(TranscodeError::UnsupportedFormat("audio (no codec configured)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    fn test_settings() -> Settings {
        Settings::for_tests()
    }

    fn tiny_png_bytes() -> Vec<u8> {
        let img = DynamicImage::new_rgb8(4, 4);
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    #[test]
    fn smil_passes_through_unchanged() {
        let file = FileAttachment::new("index.smil", "application/smil", b"<smil/>".to_vec());
        let settings = test_settings();
        let out = process_file(&file, &settings, &NullCodec).unwrap();
        assert_eq!(out.bytes, file.bytes);
    }

    #[test]
    fn oversized_input_is_rejected() {
        let settings = test_settings();
        let file = FileAttachment::new(
            "huge.bin",
            "application/octet-stream",
            vec![0u8; (settings.transcode_max_input_size + 1) as usize],
        );
        let err = process_file(&file, &settings, &NullCodec).unwrap_err();
        assert!(matches!(err, TranscodeError::FileTooLarge { .. }));
    }

    #[test]
    fn small_png_round_trips_under_target() {
        let settings = test_settings();
        let file = FileAttachment::new("a.png", "image/png", tiny_png_bytes());
        let out = process_file(&file, &settings, &NullCodec).unwrap();
        assert_eq!(out.mime_type, "image/png");
        assert!(out.bytes.len() as u64 <= TARGET_OUTPUT_SIZE);
    }

    #[test]
    fn other_mime_under_target_passes_through() {
        let settings = test_settings();
        let file = FileAttachment::new("note.txt", "text/plain", b"hello".to_vec());
        let out = process_file(&file, &settings, &NullCodec).unwrap();
        assert_eq!(out.bytes, b"hello");
    }

    #[test]
    fn other_mime_over_target_fails_compression() {
        let settings = test_settings();
        let file = FileAttachment::new(
            "note.bin",
            "application/x-custom",
            vec![7u8; (TARGET_OUTPUT_SIZE + 1) as usize],
        );
        let err = process_file(&file, &settings, &NullCodec).unwrap_err();
        assert!(matches!(err, TranscodeError::CompressionFailed));
    }

    #[tokio::test]
    async fn transcode_pipeline_isolates_single_file_failure() {
        let settings = Arc::new(test_settings());
        let pipeline = TranscodePipeline::spawn(settings, Arc::new(NullCodec), 4);
        let bad = Envelope::new("+1", "+2", MessageKind::Mms).with_files(vec![FileAttachment::new(
            "video.mp4",
            "video/mp4",
            vec![0u8; 16],
        )]);
        let result = pipeline.submit(bad).await;
        assert!(result.is_err());

        let good = Envelope::new("+1", "+2", MessageKind::Mms)
            .with_files(vec![FileAttachment::new("a.png", "image/png", tiny_png_bytes())]);
        let result = pipeline.submit(good).await;
        assert!(result.is_ok());
    }
}
