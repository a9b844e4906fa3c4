use anyhow::Result;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVCodecID::{AV_CODEC_ID_AAC, AV_CODEC_ID_MJPEG};
use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVPixelFormat::AV_PIX_FMT_YUVJ420P;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::AVSampleFormat::AV_SAMPLE_FMT_FLTP;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::{
    av_frame_free, AVCodecID, AVPacket, AVRational, AV_CODEC_FLAG_GLOBAL_HEADER,
    FF_COMPLIANCE_EXPERIMENTAL,
};
use ffmpeg_rs_raw::{AudioFifo, Decoder, Encoder, Resample, Scaler, StreamInfo};

use crate::pipeline::MJPEG_OUTPUT_BITRATE;

/// Output sample rate/layout the reserved audio chain resamples to (spec §4.1: 48kHz stereo).
const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;
const AUDIO_BITRATE: u64 = 128_000;

/// Decode -> resample (48kHz/stereo) -> 1024-sample chunk -> AAC-encode chain for a non-AAC
/// audio source. Constructed whenever the input carries audio, per spec §4.1 and §9.1, but
/// never pumped: nothing in [`CodecPipeline::transcode`] ever calls into it. Keeping it built
/// (rather than skipped) surfaces encoder/format failures at startup instead of leaving them
/// latent for whenever audio output is wired up.
struct AudioChain {
    #[allow(dead_code)]
    resample: Resample,
    #[allow(dead_code)]
    fifo: AudioFifo,
    #[allow(dead_code)]
    encoder: Encoder,
    #[allow(dead_code)]
    frame_size: i32,
}

/// Owns the decode -> scale -> MJPEG-encode chain for one stream's video track.
///
/// Short-circuited runs never call [`Self::transcode`]; they still keep an encoder around so
/// the Moment Recorder has a stream descriptor to copy codec parameters from.
pub struct CodecPipeline {
    decoder: Decoder,
    scaler: Option<Scaler>,
    encoder: Encoder,
    out_width: i32,
    out_height: i32,
    audio: Option<AudioChain>,
}

impl CodecPipeline {
    pub fn new(
        fps: f32,
        out_width: u32,
        out_height: u32,
        video_timebase: AVRational,
        audio_stream: Option<&StreamInfo>,
    ) -> Result<Self> {
        let encoder = unsafe {
            Encoder::new(AV_CODEC_ID_MJPEG)?
                .with_width(out_width as i32)
                .with_height(out_height as i32)
                .with_pix_fmt(AV_PIX_FMT_YUVJ420P)
                .with_bitrate(MJPEG_OUTPUT_BITRATE as _)
                .with_framerate(fps)?
                .with_options(|ctx| {
                    (*ctx).time_base = video_timebase;
                    (*ctx).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
                    (*ctx).strict_std_compliance = FF_COMPLIANCE_EXPERIMENTAL;
                })
                .open(None)?
        };

        let mut decoder = Decoder::new();
        let audio = match audio_stream {
            Some(stream) => unsafe { Self::build_audio_chain(&mut decoder, stream)? },
            None => None,
        };

        Ok(Self {
            decoder,
            scaler: None,
            encoder,
            out_width: out_width as i32,
            out_height: out_height as i32,
            audio,
        })
    }

    /// Registers the audio stream with the shared decoder and builds its reserved resample/AAC
    /// chain, unless the source is already AAC (in which case there is nothing to transcode).
    unsafe fn build_audio_chain(
        decoder: &mut Decoder,
        stream: &StreamInfo,
    ) -> Result<Option<AudioChain>> {
        let codec_id: AVCodecID = std::mem::transmute(stream.codec as i32);
        if codec_id == AV_CODEC_ID_AAC {
            return Ok(None);
        }

        decoder.setup_decoder(stream, None)?;

        let resample = Resample::new(AV_SAMPLE_FMT_FLTP, AUDIO_SAMPLE_RATE as _, AUDIO_CHANNELS as _);
        let fifo = AudioFifo::new(AV_SAMPLE_FMT_FLTP, AUDIO_CHANNELS as _)?;
        let encoder = Encoder::new(AV_CODEC_ID_AAC)?
            .with_sample_rate(AUDIO_SAMPLE_RATE as _)?
            .with_bitrate(AUDIO_BITRATE as _)
            .with_default_channel_layout(AUDIO_CHANNELS as _)
            .with_sample_format(AV_SAMPLE_FMT_FLTP)
            .open(None)?;
        let frame_size = (*encoder.codec_context()).frame_size;

        Ok(Some(AudioChain {
            resample,
            fifo,
            encoder,
            frame_size,
        }))
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Decodes `pkt`, downscales each resulting frame, and MJPEG-encodes it. `pkt` is borrowed,
    /// not freed here. A packet producing no frame (B-frame reorder buffering, etc.) yields an
    /// empty result, which callers treat as "drop and continue".
    pub unsafe fn transcode(&mut self, pkt: *mut AVPacket) -> Result<Vec<*mut AVPacket>> {
        let frames = self.decoder.decode_pkt(pkt)?;
        let mut encoded = Vec::new();
        for (mut frame, _stream) in frames {
            let scaler = self.scaler.get_or_insert_with(Scaler::new);
            let mut scaled =
                scaler.process_frame(frame, self.out_width, self.out_height, AV_PIX_FMT_YUVJ420P)?;
            encoded.extend(self.encoder.encode_frame(scaled)?);
            av_frame_free(&mut scaled);
            av_frame_free(&mut frame);
        }
        Ok(encoded)
    }
}
