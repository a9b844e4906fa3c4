use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::pipeline::StreamConfig;

/// Per-stream moment intent, mutated only through [`WorkerState::upsert`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MomentState {
    pub should_write_moment: bool,
    pub current_moment_id: Option<String>,
    pub discard_previous_maybe_moment: bool,
}

/// A partial update to [`MomentState`]. `None` means "not supplied, leave as-is"; for
/// `current_moment_id` the outer `Option` is presence and the inner one is the new value
/// (so a caller can explicitly clear it by supplying `Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct MomentStateUpdate {
    pub should_write_moment: Option<bool>,
    pub current_moment_id: Option<Option<String>>,
    pub discard_previous_maybe_moment: Option<bool>,
}

impl MomentState {
    fn apply(&mut self, update: MomentStateUpdate) {
        if let Some(v) = update.should_write_moment {
            self.should_write_moment = v;
        }
        if let Some(v) = update.current_moment_id {
            self.current_moment_id = v;
        }
        if let Some(v) = update.discard_previous_maybe_moment {
            self.discard_previous_maybe_moment = v;
        }
    }
}

/// Process-wide map from stream id to moment intent. Created on first `set_moment_state`,
/// removed on `stop_stream`.
#[derive(Debug, Default)]
pub struct WorkerState {
    streams: HashMap<String, MomentState>,
}

pub type SharedWorkerState = Arc<Mutex<WorkerState>>;

impl WorkerState {
    /// Current moment intent for `id`, or the all-false default if no `set_moment_state` has
    /// ever been received for it.
    pub fn get(&self, id: &str) -> MomentState {
        self.streams.get(id).cloned().unwrap_or_default()
    }

    pub fn upsert(&mut self, id: &str, update: MomentStateUpdate) {
        self.streams.entry(id.to_string()).or_default().apply(update);
    }

    pub fn remove(&mut self, id: &str) {
        self.streams.remove(id);
    }
}

/// The three inbound control messages, consumed off a single-threaded queue.
#[derive(Debug)]
pub enum Command {
    /// `messages` is this run's private outbound channel; the caller keeps the matching
    /// receiver to forward encoded [`crate::message::StreamEnvelope`] bytes onward.
    StartStream {
        config: StreamConfig,
        messages: UnboundedSender<bytes::Bytes>,
    },
    StopStream {
        id: String,
    },
    SetMomentState {
        id: String,
        update: MomentStateUpdate,
    },
}

/// Cheap-to-clone handle for submitting commands from any task.
#[derive(Clone)]
pub struct CommandHandle {
    tx: UnboundedSender<Command>,
}

impl CommandHandle {
    pub fn new(tx: UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Submits a `start_stream` command and returns the receiver for this run's outbound
    /// messages (one `codec`, then `frame`/`moment_clip_saved`, terminated by `ended`).
    pub fn start_stream(&self, config: StreamConfig) -> anyhow::Result<UnboundedReceiver<bytes::Bytes>> {
        let (messages, rx) = mpsc::unbounded_channel();
        self.tx.send(Command::StartStream { config, messages })?;
        Ok(rx)
    }

    pub fn stop_stream(&self, id: impl Into<String>) -> anyhow::Result<()> {
        self.tx.send(Command::StopStream { id: id.into() })?;
        Ok(())
    }

    pub fn set_moment_state(
        &self,
        id: impl Into<String>,
        update: MomentStateUpdate,
    ) -> anyhow::Result<()> {
        self.tx.send(Command::SetMomentState {
            id: id.into(),
            update,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_entry_on_first_set() {
        let mut state = WorkerState::default();
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: Some(true),
                current_moment_id: Some(Some("m1".to_string())),
                discard_previous_maybe_moment: None,
            },
        );
        let s = state.get("a");
        assert!(s.should_write_moment);
        assert_eq!(s.current_moment_id, Some("m1".to_string()));
        assert!(!s.discard_previous_maybe_moment);
    }

    #[test]
    fn upsert_preserves_fields_not_supplied() {
        let mut state = WorkerState::default();
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: Some(true),
                current_moment_id: Some(Some("m1".to_string())),
                discard_previous_maybe_moment: None,
            },
        );
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: Some(false),
                current_moment_id: None,
                discard_previous_maybe_moment: None,
            },
        );
        let s = state.get("a");
        assert!(!s.should_write_moment);
        // current_moment_id untouched by the second, partial update.
        assert_eq!(s.current_moment_id, Some("m1".to_string()));
    }

    #[test]
    fn explicit_none_clears_current_moment_id() {
        let mut state = WorkerState::default();
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: Some(true),
                current_moment_id: Some(Some("m1".to_string())),
                discard_previous_maybe_moment: None,
            },
        );
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: None,
                current_moment_id: Some(None),
                discard_previous_maybe_moment: None,
            },
        );
        assert_eq!(state.get("a").current_moment_id, None);
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut state = WorkerState::default();
        state.upsert(
            "a",
            MomentStateUpdate {
                should_write_moment: Some(true),
                ..Default::default()
            },
        );
        state.remove("a");
        assert_eq!(state.get("a"), MomentState::default());
    }
}
