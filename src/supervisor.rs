use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, SharedWorkerState, WorkerState};
use crate::pipeline::driver::{self, DriverExit};
use crate::pipeline::StreamConfig;
use crate::settings::Settings;

const INITIAL_HEARTS: i32 = 5;
const STABILITY_RESET: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consumes commands off the queue for the process's lifetime, owning [`WorkerState`] and the
/// registry of per-stream abort tokens. Each `start_stream` spawns its own supervised run on a
/// dedicated OS thread; this loop itself never blocks on stream I/O.
pub async fn run_command_loop(mut rx: UnboundedReceiver<Command>, settings: Settings) {
    let state: SharedWorkerState = Arc::new(Mutex::new(WorkerState::default()));
    let mut aborts: HashMap<String, CancellationToken> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::StartStream { config, messages } => {
                let token = CancellationToken::new();
                aborts.insert(config.id.clone(), token.clone());
                let state = state.clone();
                let settings = settings.clone();
                std::thread::spawn(move || supervise(config, token, state, settings, messages));
            }
            Command::StopStream { id } => {
                if let Some(token) = aborts.remove(&id) {
                    token.cancel();
                }
                state.lock().unwrap().remove(&id);
            }
            Command::SetMomentState { id, update } => {
                state.lock().unwrap().upsert(&id, update);
            }
        }
    }
}

/// Hearts-based restart loop wrapping a single stream's driver runs (spec §4.5).
fn supervise(
    config: StreamConfig,
    abort: CancellationToken,
    state: SharedWorkerState,
    settings: Settings,
    messages: tokio::sync::mpsc::UnboundedSender<bytes::Bytes>,
) {
    let mut hearts = INITIAL_HEARTS;

    loop {
        if abort.is_cancelled() {
            return;
        }

        let started = Instant::now();
        let outcome = driver::run(&config, abort.clone(), state.clone(), &settings, messages.clone());
        // A run lasting at least the stability window counts as the 30s timer having fired,
        // regardless of what (if anything) goes wrong on this attempt.
        if started.elapsed() >= STABILITY_RESET {
            hearts = INITIAL_HEARTS;
        }

        match outcome {
            Ok(DriverExit::Aborted) => return,
            Ok(DriverExit::Graceful) => {
                if config.uri.starts_with(&settings.loop_uri_prefix) {
                    info!("stream {} looping on graceful end", config.id);
                    continue;
                }
                return;
            }
            Err(e) => {
                hearts -= 1;
                error!(
                    "stream {} run failed ({} hearts remaining): {e}",
                    config.id, hearts
                );
                if hearts <= 0 || abort.is_cancelled() {
                    warn!("stream {} exhausted its hearts, giving up", config.id);
                    return;
                }
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
}
