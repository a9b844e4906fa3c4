use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ffmpeg_rs_raw::ffmpeg_sys_the_third::{AVPacket, AVStream};
use ffmpeg_rs_raw::{Demuxer, DemuxerInfo};
use tokio_util::sync::CancellationToken;

/// Packets are pulled with a cooperative timeout: if none arrives within this window the run
/// ends gracefully rather than blocking forever on a stalled source.
pub const PACKET_PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a source URI for pull-based playback. RTSP sources are forced to TCP transport;
/// everything else uses FFmpeg's defaults.
///
/// The returned handle installs an interrupt callback armed by [`InputSource::get_packet`] so a
/// stalled `avformat_read_frame` unblocks after [`PACKET_PULL_TIMEOUT`], and races the same
/// abort token the driver loop checks between pulls, so a mid-pull abort on a stalled source
/// unblocks immediately instead of waiting out the timeout.
pub struct InputSource {
    demuxer: Demuxer,
    deadline: Arc<Mutex<Instant>>,
}

impl InputSource {
    pub fn open(uri: &str, abort: CancellationToken) -> Result<(Self, DemuxerInfo)> {
        let deadline = Arc::new(Mutex::new(Instant::now() + PACKET_PULL_TIMEOUT));
        let cb_deadline = deadline.clone();

        let mut options = HashMap::new();
        if uri.starts_with("rtsp://") {
            options.insert("rtsp_transport".to_string(), "tcp".to_string());
        }

        let mut demuxer = unsafe {
            Demuxer::new_with_interrupt(
                uri,
                if options.is_empty() {
                    None
                } else {
                    Some(options)
                },
                move || abort.is_cancelled() || Instant::now() > *cb_deadline.lock().unwrap(),
            )
            .with_context(|| format!("failed to open input: {uri}"))?
        };
        let info = unsafe {
            demuxer
                .probe_input()
                .with_context(|| format!("failed to probe input: {uri}"))?
        };
        Ok((Self { demuxer, deadline }, info))
    }

    /// Seeks to `position_sec` into the source. Called once, before the driver loop starts.
    pub fn seek(&mut self, position_sec: f64) -> Result<()> {
        self.arm_timeout();
        unsafe { self.demuxer.seek(position_sec) }
    }

    fn arm_timeout(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + PACKET_PULL_TIMEOUT;
    }

    /// Pulls the next demuxed packet, or `None` on clean end-of-stream / interrupt timeout.
    pub unsafe fn get_packet(&mut self) -> Result<Option<(*mut AVPacket, *mut AVStream)>> {
        self.arm_timeout();
        let (pkt, stream) = self.demuxer.get_packet()?;
        if pkt.is_null() {
            Ok(None)
        } else {
            Ok(Some((pkt, stream)))
        }
    }
}
