use std::time::{Duration, Instant};

use crate::fraction::Fraction;

/// Hard cap on any single pacer-induced sleep, in both live and file mode.
const MAX_SLEEP_MS: f64 = 5_000.0;

/// Fixed live-mode throttle interval (spec: 1000/30 ms), independent of source fps.
const LIVE_THROTTLE_MS: f64 = 1000.0 / 30.0;

/// A packet landing later than this many ms past its scheduled wall-clock slot is logged,
/// but never skipped, in file mode.
const LATE_WARN_THRESHOLD_MS: f64 = 100.0;

/// Which timing strategy a run uses, decided once at startup by probing the source URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacerMode {
    /// Local file playback (or any ephemeral run): paced against the source's own pts.
    File,
    /// RTSP/HTTP live source: simple wall-clock throttling, no pts involved.
    Live,
}

impl PacerMode {
    /// `file` iff the URI looks like a local path, or the stream is ephemeral.
    pub fn detect(uri: &str, is_ephemeral: bool) -> Self {
        if is_ephemeral {
            return PacerMode::File;
        }
        match url::Url::parse(uri) {
            Ok(u) => match u.scheme() {
                "file" => PacerMode::File,
                "rtsp" | "http" | "https" | "rtmp" | "srt" => PacerMode::Live,
                _ => PacerMode::File,
            },
            // No scheme parses as a bare filesystem path.
            Err(_) => PacerMode::File,
        }
    }
}

/// What the driver should do with the packet currently being processed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacerDecision {
    /// Drop this packet without decoding (live-mode throttle only).
    Skip,
    /// Proceed, attaching this progress timestamp if the run is ephemeral.
    Emit { timestamp_ms: Option<i64> },
}

/// Returns the paced frame interval for a source reporting `fps`. Non-finite or non-positive
/// values fall back to 30fps, per spec.
pub fn target_frame_interval_ms(fps: f32) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        let interval = 1000.0 / fps as f64;
        if interval.is_finite() && interval > 0.0 {
            return interval;
        }
    }
    1000.0 / 30.0
}

/// Deficit (ms) to sleep before decoding, given the time since the *previous post-delay's*
/// `last_frame_send` update. Intentionally stale by one packet — see DESIGN.md.
fn pre_delay_ms(elapsed_since_last_send_ms: f64, target_interval_ms: f64) -> f64 {
    let deficit = target_interval_ms - elapsed_since_last_send_ms;
    if !deficit.is_finite() || deficit <= 0.0 {
        0.0
    } else {
        deficit.min(MAX_SLEEP_MS)
    }
}

fn elapsed_file_ms(pkt_pts: i64, first_pts: i64, timebase: Fraction) -> f64 {
    if timebase.den == 0 {
        return 0.0;
    }
    (pkt_pts - first_pts) as f64 * timebase.num as f64 * 1000.0 / timebase.den as f64
}

/// Delay (ms) to sleep after emitting, to land the *next* wall-clock deadline.
fn post_delay_ms(elapsed_since_start_ms: f64, elapsed_file_ms: f64) -> f64 {
    let delay = elapsed_file_ms - elapsed_since_start_ms;
    if !delay.is_finite() || delay <= 0.0 {
        0.0
    } else {
        delay.min(MAX_SLEEP_MS)
    }
}

/// Stateful pacing decisions for a single stream run. Owns no FFmpeg handles; the driver sleeps
/// for whatever [`Duration`]s this returns.
pub struct FramePacer {
    mode: PacerMode,
    is_ephemeral: bool,
    init_seek_ms: i64,
    target_frame_interval_ms: f64,

    last_live_send: Option<Instant>,

    first_pts: Option<i64>,
    playback_start: Option<Instant>,
    /// Updated only in the post-delay branch; read by the pre-delay branch on the *next*
    /// packet, one packet stale by design (spec §9 open question).
    last_frame_send: Option<Instant>,
}

impl FramePacer {
    pub fn new(mode: PacerMode, fps: f32, is_ephemeral: bool, init_seek_sec: Option<f64>) -> Self {
        Self {
            mode,
            is_ephemeral,
            init_seek_ms: (init_seek_sec.unwrap_or(0.0) * 1000.0) as i64,
            target_frame_interval_ms: target_frame_interval_ms(fps),
            last_live_send: None,
            first_pts: None,
            playback_start: None,
            last_frame_send: None,
        }
    }

    pub fn mode(&self) -> PacerMode {
        self.mode
    }

    /// Live-mode decision: skip or emit. No-op in file mode (always emits, see [`Self::pre_delay`]).
    pub fn live_decision(&mut self, now: Instant) -> PacerDecision {
        debug_assert_eq!(self.mode, PacerMode::Live);
        let skip = match self.last_live_send {
            Some(last) => now.duration_since(last).as_secs_f64() * 1000.0 < LIVE_THROTTLE_MS,
            None => false,
        };
        if skip {
            PacerDecision::Skip
        } else {
            self.last_live_send = Some(now);
            PacerDecision::Emit { timestamp_ms: None }
        }
    }

    /// True for the first video packet seen in file mode: records `first_pts`/`playback_start`
    /// and must not be delayed either side.
    pub fn is_first_file_packet(&self) -> bool {
        self.first_pts.is_none()
    }

    pub fn init_first_file_packet(&mut self, pts: i64, now: Instant) {
        self.first_pts = Some(pts);
        self.playback_start = Some(now);
    }

    /// Sleep duration to apply *before* decoding a non-first file-mode packet.
    pub fn pre_delay(&self, now: Instant) -> Duration {
        debug_assert_eq!(self.mode, PacerMode::File);
        let Some(last_send) = self.last_frame_send else {
            return Duration::ZERO;
        };
        let elapsed_ms = now.duration_since(last_send).as_secs_f64() * 1000.0;
        Duration::from_secs_f64(pre_delay_ms(elapsed_ms, self.target_frame_interval_ms) / 1000.0)
    }

    /// Sleep duration (and whether it logged as "late") to apply *after* emitting a file-mode
    /// packet, plus the progress timestamp for ephemeral runs. Also updates `last_frame_send`.
    pub fn post_delay(&mut self, pkt_pts: i64, timebase: Fraction, now: Instant) -> PostDelayOutcome {
        debug_assert_eq!(self.mode, PacerMode::File);
        let first_pts = self.first_pts.unwrap_or(pkt_pts);
        let start = self.playback_start.unwrap_or(now);

        let file_ms = elapsed_file_ms(pkt_pts, first_pts, timebase);
        let since_start_ms = now.duration_since(start).as_secs_f64() * 1000.0;
        let delay_ms = post_delay_ms(since_start_ms, file_ms);

        self.last_frame_send = Some(now);

        PostDelayOutcome {
            sleep: Duration::from_secs_f64(delay_ms / 1000.0),
            is_late: since_start_ms - file_ms > LATE_WARN_THRESHOLD_MS,
            timestamp_ms: if self.is_ephemeral {
                Some(self.init_seek_ms + file_ms.round() as i64)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostDelayOutcome {
    pub sleep: Duration,
    pub is_late: bool,
    pub timestamp_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_interval_defaults_to_30fps_on_bad_input() {
        assert!((target_frame_interval_ms(0.0) - 1000.0 / 30.0).abs() < 1e-9);
        assert!((target_frame_interval_ms(-5.0) - 1000.0 / 30.0).abs() < 1e-9);
        assert!((target_frame_interval_ms(f32::NAN) - 1000.0 / 30.0).abs() < 1e-9);
        assert!((target_frame_interval_ms(f32::INFINITY) - 1000.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn target_interval_matches_source_fps() {
        assert!((target_frame_interval_ms(30.0) - 1000.0 / 30.0).abs() < 1e-6);
        let sixty = target_frame_interval_ms(60.0);
        assert!(sixty > 0.0 && sixty <= 1000.0 / 24.0);
    }

    #[test]
    fn pre_delay_sleeps_for_remaining_deficit() {
        assert_eq!(pre_delay_ms(10.0, 33.3), 23.3);
        assert_eq!(pre_delay_ms(40.0, 33.3), 0.0);
    }

    #[test]
    fn pre_delay_caps_at_five_seconds() {
        assert_eq!(pre_delay_ms(0.0, 50_000.0), MAX_SLEEP_MS);
    }

    #[test]
    fn post_delay_targets_file_pts_schedule() {
        // 1000ms of file content elapsed, only 200ms of wall clock spent: should wait ~800ms.
        assert_eq!(post_delay_ms(200.0, 1000.0), 800.0);
        // Running behind schedule: no negative sleeps.
        assert_eq!(post_delay_ms(1500.0, 1000.0), 0.0);
    }

    #[test]
    fn elapsed_file_ms_rescales_by_timebase() {
        let tb = Fraction { num: 1, den: 90_000 };
        // 90_000 ticks @ 1/90000 = 1 second = 1000ms
        assert!((elapsed_file_ms(90_000, 0, tb) - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn live_throttle_skips_within_window() {
        let mut pacer = FramePacer::new(PacerMode::Live, 30.0, false, None);
        let t0 = Instant::now();
        assert_eq!(
            pacer.live_decision(t0),
            PacerDecision::Emit { timestamp_ms: None }
        );
        // Immediately after: still inside the 33.3ms window.
        assert_eq!(pacer.live_decision(t0), PacerDecision::Skip);
        let t1 = t0 + Duration::from_millis(34);
        assert_eq!(
            pacer.live_decision(t1),
            PacerDecision::Emit { timestamp_ms: None }
        );
    }

    #[test]
    fn ephemeral_timestamp_includes_init_seek() {
        let mut pacer = FramePacer::new(PacerMode::File, 30.0, true, Some(5.0));
        let t0 = Instant::now();
        pacer.init_first_file_packet(0, t0);
        let tb = Fraction { num: 1, den: 1000 };
        let outcome = pacer.post_delay(500, tb, t0 + Duration::from_millis(500));
        assert_eq!(outcome.timestamp_ms, Some(5_000 + 500));
    }

    #[test]
    fn pacer_mode_detection() {
        assert_eq!(PacerMode::detect("rtsp://host/stream", false), PacerMode::Live);
        assert_eq!(PacerMode::detect("http://host/stream.ts", false), PacerMode::Live);
        assert_eq!(PacerMode::detect("file:///tmp/clip.mkv", false), PacerMode::File);
        assert_eq!(PacerMode::detect("/tmp/clip.mkv", false), PacerMode::File);
        assert_eq!(PacerMode::detect("rtsp://host/stream", true), PacerMode::File);
    }
}
