use std::time::Instant;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ffmpeg_rs_raw::ffmpeg_sys_the_third::{av_packet_free, AVRational};
use ffmpeg_rs_raw::StreamType;
use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::command::SharedWorkerState;
use crate::egress::recorder::MomentRecorder;
use crate::fraction::Fraction;
use crate::ingress::InputSource;
use crate::message::{StreamEnvelope, StreamMessage};
use crate::pipeline::codec::CodecPipeline;
use crate::pipeline::pacer::{FramePacer, PacerDecision, PacerMode};
use crate::pipeline::{compute_output_dimensions, should_skip_transcode, CodecIdentity, StreamConfig};
use crate::settings::Settings;

/// How the driver's main loop ended. `Err` is reserved for failures the supervisor should
/// retry; these two outcomes are control flow, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    Graceful,
    Aborted,
}

/// Runs one stream end-to-end: opens the input, publishes `codec`, then loops pulling packets
/// until EOF, timeout, or abort, finally closing any open moment recording and publishing
/// `ended`. Intended to run on its own OS thread (blocking I/O and sleeps throughout).
pub fn run(
    config: &StreamConfig,
    abort: CancellationToken,
    worker_state: SharedWorkerState,
    settings: &Settings,
    messages: UnboundedSender<Bytes>,
) -> Result<DriverExit> {
    let (mut source, info) = InputSource::open(&config.uri, abort.clone())
        .with_context(|| format!("opening {}", config.uri))?;

    let video_stream = info
        .streams
        .iter()
        .find(|s| s.stream_type == StreamType::Video)
        .context("input has no video stream")?;

    let (out_w, out_h) = compute_output_dimensions(video_stream.width as u32, video_stream.height as u32);
    let audio_stream = info.streams.iter().find(|s| s.stream_type == StreamType::Audio);
    let has_audio = audio_stream.is_some();

    let identity = CodecIdentity {
        mime_type: "image/jpeg".to_string(),
        video_codec: "mjpeg".to_string(),
        audio_codec: None,
        codec_string: "mjpeg".to_string(),
        full_codec: "image/jpeg; codecs=\"mjpeg\"".to_string(),
        width: out_w,
        height: out_h,
        has_audio,
    };
    publish(&messages, config, StreamMessage::Codec(identity))?;

    // `StreamInfo` carries no timebase of its own (only `fps`); approximate the encoder's
    // timebase from it rather than inventing an unverified field access. See DESIGN.md.
    let video_timebase = AVRational {
        num: 1,
        den: video_stream.fps.round().max(1.0) as i32,
    };
    let mut codec = CodecPipeline::new(video_stream.fps, out_w, out_h, video_timebase, audio_stream)?;

    if let Some(seek) = config.init_seek_sec {
        source.seek(seek)?;
    }

    let mut pacer = FramePacer::new(
        PacerMode::detect(&config.uri, config.is_ephemeral),
        video_stream.fps,
        config.is_ephemeral,
        config.init_seek_sec,
    );

    let save_root = config
        .save_location
        .clone()
        .unwrap_or_else(|| settings.moments_dir.clone().into());
    let mut recorder = (!config.is_ephemeral).then(|| MomentRecorder::new(config.id.clone(), save_root));

    let video_stream_index = video_stream.index;

    let exit = loop {
        if abort.is_cancelled() {
            break DriverExit::Aborted;
        }

        let pulled = unsafe { source.get_packet() };
        let Some((mut pkt, stream)) = (match pulled {
            Ok(p) => p,
            Err(e) => {
                warn!("stream {}: packet pull error: {e}", config.id);
                None
            }
        }) else {
            // A stalled pull unblocks on either the interrupt timeout or the abort token; only
            // the latter should skip the supervisor's retry-on-graceful-end handling.
            break if abort.is_cancelled() {
                DriverExit::Aborted
            } else {
                DriverExit::Graceful
            };
        };

        // Reconciled on every pulled packet, video or not, per the recorder's own cadence.
        if let Some(rec) = recorder.as_mut() {
            let state = worker_state.lock().unwrap().get(&config.id);
            let now_ms = chrono::Utc::now().timestamp_millis();
            match unsafe { rec.reconcile(&state, now_ms, codec.encoder()) } {
                Ok(Some(saved)) => publish(&messages, config, saved)?,
                Ok(None) => {}
                Err(e) => error!("stream {}: moment recorder error: {e}", config.id),
            }
        }

        if unsafe { (*stream).index } as usize != video_stream_index {
            unsafe { av_packet_free(&mut pkt) };
            continue;
        }
        let stream_timebase = unsafe { (*stream).time_base };
        let timebase = Fraction {
            num: stream_timebase.num.max(1) as usize,
            den: stream_timebase.den.max(1) as usize,
        };

        let now = Instant::now();
        let decision = match pacer.mode() {
            PacerMode::Live => pacer.live_decision(now),
            PacerMode::File => PacerDecision::Emit { timestamp_ms: None },
        };
        if decision == PacerDecision::Skip {
            unsafe { av_packet_free(&mut pkt) };
            continue;
        }

        let is_first = pacer.mode() == PacerMode::File && pacer.is_first_file_packet();
        if pacer.mode() == PacerMode::File && !is_first {
            std::thread::sleep(pacer.pre_delay(now));
        }
        if is_first {
            pacer.init_first_file_packet(unsafe { (*pkt).pts }, now);
        }

        let pkt_pts = unsafe { (*pkt).pts };
        let src_codec_id = unsafe { std::mem::transmute(video_stream.codec as i32) };
        let src_pix_fmt = unsafe { std::mem::transmute(video_stream.format as i32) };

        let outgoing = if should_skip_transcode(src_codec_id, src_pix_fmt) {
            let data = unsafe {
                std::slice::from_raw_parts((*pkt).data, (*pkt).size as usize).to_vec()
            };
            if let Some(rec) = recorder.as_mut() {
                if rec.is_open() {
                    if let Err(e) = unsafe { rec.append(pkt, Instant::now()) } {
                        error!("stream {}: moment append failed: {e}", config.id);
                    }
                }
            }
            Some(data)
        } else {
            match unsafe { codec.transcode(pkt) } {
                Ok(encoded) => {
                    let mut data = None;
                    for enc_pkt in encoded {
                        if data.is_none() {
                            data = Some(unsafe {
                                std::slice::from_raw_parts((*enc_pkt).data, (*enc_pkt).size as usize)
                                    .to_vec()
                            });
                        }
                        if let Some(rec) = recorder.as_mut() {
                            if rec.is_open() {
                                if let Err(e) = unsafe { rec.append(enc_pkt, Instant::now()) } {
                                    error!("stream {}: moment append failed: {e}", config.id);
                                }
                            }
                        }
                        let mut enc_pkt = enc_pkt;
                        unsafe { av_packet_free(&mut enc_pkt) };
                    }
                    data
                }
                Err(e) => {
                    warn!("stream {}: transcode error, dropping packet: {e}", config.id);
                    None
                }
            }
        };

        unsafe { av_packet_free(&mut pkt) };

        let Some(data) = outgoing else {
            continue;
        };

        let timestamp_ms = if pacer.mode() == PacerMode::File {
            let outcome = pacer.post_delay(pkt_pts, timebase, Instant::now());
            std::thread::sleep(outcome.sleep);
            if outcome.is_late {
                warn!("stream {}: frame emitted late", config.id);
            }
            outcome.timestamp_ms
        } else {
            None
        };

        publish(&messages, config, StreamMessage::Frame { data, timestamp_ms })?;
    };

    if let Some(rec) = recorder.as_mut() {
        if rec.is_open() {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let always_write = crate::command::MomentState {
                should_write_moment: false,
                current_moment_id: None,
                discard_previous_maybe_moment: false,
            };
            // Finalizes (renames with trailer) so nothing is left mid-write on disk, but a
            // moment ending only because the stream itself ended is not a `moment_clip_saved`
            // event — `ended` is the last message this run ever publishes.
            if let Err(e) = unsafe { rec.reconcile(&always_write, now_ms, codec.encoder()) } {
                error!("stream {}: final moment close failed: {e}", config.id);
            }
        }
    }

    publish(&messages, config, StreamMessage::Ended)?;
    info!("stream {} driver exiting: {:?}", config.id, exit);
    Ok(exit)
}

fn publish(
    messages: &UnboundedSender<Bytes>,
    config: &StreamConfig,
    message: StreamMessage,
) -> Result<()> {
    let envelope = StreamEnvelope {
        id: config.id.clone(),
        session_id: config.session_id.clone(),
        is_ephemeral: config.is_ephemeral,
        message,
    };
    let Ok(bytes) = envelope.encode() else {
        bail!("failed to encode outbound message for stream {}", config.id);
    };
    // The receiving end may already be gone (caller dropped it); that's not this run's problem.
    let _ = messages.send(bytes);
    Ok(())
}
