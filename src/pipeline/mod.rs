use std::path::PathBuf;

use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVCodecID;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVCodecID::AV_CODEC_ID_MJPEG;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVPixelFormat::{
    self, AV_PIX_FMT_BGR24, AV_PIX_FMT_BGR4, AV_PIX_FMT_BGR4_BYTE, AV_PIX_FMT_BGR8,
    AV_PIX_FMT_GRAY8, AV_PIX_FMT_MONOBLACK, AV_PIX_FMT_MONOWHITE, AV_PIX_FMT_PAL8,
    AV_PIX_FMT_RGB24, AV_PIX_FMT_RGB4, AV_PIX_FMT_RGB4_BYTE, AV_PIX_FMT_RGB8, AV_PIX_FMT_UYVY422,
    AV_PIX_FMT_UYYVYY411, AV_PIX_FMT_YUV410P, AV_PIX_FMT_YUV411P, AV_PIX_FMT_YUV420P,
    AV_PIX_FMT_YUV422P, AV_PIX_FMT_YUV444P, AV_PIX_FMT_YUVJ420P, AV_PIX_FMT_YUVJ422P,
    AV_PIX_FMT_YUVJ444P, AV_PIX_FMT_YUYV422,
};
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod driver;
pub mod pacer;

/// Longest side of the output frame. Inputs larger than this are downscaled proportionally.
pub const MAX_OUTPUT_DIMENSION: u32 = 720;

/// MJPEG output bitrate target.
pub const MJPEG_OUTPUT_BITRATE: u64 = 2_000_000;

/// Pixel formats for which an already-MJPEG source is republished without re-encoding.
const SHORT_CIRCUIT_PIXEL_FORMATS: &[AVPixelFormat] = &[
    AV_PIX_FMT_YUV420P,
    AV_PIX_FMT_YUYV422,
    AV_PIX_FMT_RGB24,
    AV_PIX_FMT_BGR24,
    AV_PIX_FMT_YUV422P,
    AV_PIX_FMT_YUV444P,
    AV_PIX_FMT_YUV410P,
    AV_PIX_FMT_YUV411P,
    AV_PIX_FMT_GRAY8,
    AV_PIX_FMT_MONOWHITE,
    AV_PIX_FMT_MONOBLACK,
    AV_PIX_FMT_PAL8,
    AV_PIX_FMT_YUVJ420P,
    AV_PIX_FMT_YUVJ422P,
    AV_PIX_FMT_YUVJ444P,
    AV_PIX_FMT_UYVY422,
    AV_PIX_FMT_UYYVYY411,
    AV_PIX_FMT_BGR8,
    AV_PIX_FMT_BGR4,
    AV_PIX_FMT_BGR4_BYTE,
    AV_PIX_FMT_RGB8,
    AV_PIX_FMT_RGB4,
    AV_PIX_FMT_RGB4_BYTE,
];

/// True iff the input can be republished as-is instead of being re-encoded to MJPEG.
pub fn should_skip_transcode(codec_id: AVCodecID, pixel_format: AVPixelFormat) -> bool {
    codec_id == AV_CODEC_ID_MJPEG && SHORT_CIRCUIT_PIXEL_FORMATS.contains(&pixel_format)
}

/// Scales `(width, height)` down so the longer side is at most [`MAX_OUTPUT_DIMENSION`],
/// preserving aspect ratio. Pass-through if already within bounds.
pub fn compute_output_dimensions(width: u32, height: u32) -> (u32, u32) {
    let longer = width.max(height);
    if longer <= MAX_OUTPUT_DIMENSION || longer == 0 {
        return (width, height);
    }
    let scale = MAX_OUTPUT_DIMENSION as f64 / longer as f64;
    (
        (width as f64 * scale).round() as u32,
        (height as f64 * scale).round() as u32,
    )
}

/// Immutable configuration for a single stream run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub uri: String,
    pub save_location: Option<PathBuf>,
    pub init_seek_sec: Option<f64>,
    pub is_ephemeral: bool,
    pub session_id: Option<String>,
}

/// Emitted once per run as the first downstream message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecIdentity {
    pub mime_type: String,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub codec_string: String,
    pub full_codec: String,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVCodecID::AV_CODEC_ID_H264;

    #[test]
    fn passthrough_when_already_small() {
        assert_eq!(compute_output_dimensions(640, 480), (640, 480));
        assert_eq!(compute_output_dimensions(720, 720), (720, 720));
    }

    #[test]
    fn downscales_longer_side_to_720() {
        assert_eq!(compute_output_dimensions(1280, 720), (720, 405));
        assert_eq!(compute_output_dimensions(1920, 1080), (720, 405));
    }

    #[test]
    fn short_circuit_requires_mjpeg_and_permitted_format() {
        assert!(should_skip_transcode(AV_CODEC_ID_MJPEG, AV_PIX_FMT_YUV420P));
        assert!(!should_skip_transcode(AV_CODEC_ID_H264, AV_PIX_FMT_YUV420P));
    }
}
