use std::ffi::CStr;

use log::info;
use moment_stream_worker::command::CommandHandle;
use moment_stream_worker::settings::Settings;
use moment_stream_worker::supervisor;
use tokio::sync::mpsc;

/// Host-process entry point. Loads settings, starts the command loop, and exposes a
/// [`CommandHandle`] for whatever transport a deployment wires up (spec §6.1: no network
/// control-plane is specified, so none is invented here).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    unsafe {
        info!(
            "FFmpeg version={}",
            CStr::from_ptr(ffmpeg_rs_raw::ffmpeg_sys_the_third::av_version_info())
                .to_str()
                .unwrap_or("unknown")
        );
    }

    let settings = Settings::load()?;
    info!("moments directory: {}", settings.moments_dir);

    let (tx, rx) = mpsc::unbounded_channel();
    let _handle = CommandHandle::new(tx);
    let loop_task = tokio::spawn(supervisor::run_command_loop(rx, settings));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    loop_task.abort();
    Ok(())
}
