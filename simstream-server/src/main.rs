//! simulator-server — persistent capture/stream/inject session for one
//! iOS simulator.
//!
//! ```text
//! simulator-server --udid <uuid> [--fps N] [--quality Q] [--port P]
//! ```
//!
//! On success the process prints exactly one handshake line on stdout:
//!
//! ```text
//! stream_ready http://127.0.0.1:<port>/stream.mjpeg
//! ```
//!
//! after which stdout carries only optional `fps_report` lines. All
//! diagnostics go to stderr. Commands arrive on stdin (see the command
//! grammar in `simstream-core`); `shutdown` ends the process with
//! exit code 0.

mod report;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use simstream_core::ring::DEFAULT_CAPACITY;
use simstream_core::{
    run_pipeline, Command, CommandReader, DeviceBridge, FrameRing, HidInjector, MjpegServer,
    PipelineStats, ServerError, SessionParams, SURFACE_CHANNEL_DEPTH,
};

use report::FpsReport;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "simulator-server",
    about = "MJPEG streaming and input injection for one iOS simulator",
    disable_version_flag = true
)]
struct Cli {
    /// UDID of the simulator to attach to.
    #[arg(long)]
    udid: Option<String>,

    /// Target frames per second (clamped to 1..=120).
    #[arg(long)]
    fps: Option<u32>,

    /// JPEG quality (clamped to 0.1..=1.0).
    #[arg(long)]
    quality: Option<f32>,

    /// HTTP port; 0 requests an ephemeral port.
    #[arg(long)]
    port: Option<u16>,
}

const USAGE: &str = "usage: simulator-server --udid <uuid> [--fps N] [--quality Q] [--port P]";

/// Drop argv entries that are not part of the flag set, logging each.
/// Unknown flags are ignored rather than fatal so older orchestrators
/// can pass newer options harmlessly.
fn known_args() -> Vec<String> {
    const VALUE_FLAGS: [&str; 4] = ["--udid", "--fps", "--quality", "--port"];

    let mut args = std::env::args();
    let mut kept: Vec<String> = Vec::new();
    kept.extend(args.next()); // program name

    while let Some(arg) = args.next() {
        if arg == "-h" || arg == "--help" {
            kept.push(arg);
            continue;
        }
        let name = arg.split_once('=').map_or(arg.as_str(), |(n, _)| n);
        if VALUE_FLAGS.contains(&name) {
            let has_inline_value = arg.contains('=');
            kept.push(arg.clone());
            if !has_inline_value {
                if let Some(value) = args.next() {
                    kept.push(value);
                }
            }
        } else {
            tracing::warn!("ignoring unknown argument: {arg}");
        }
    }
    kept
}

fn parse_cli() -> SessionParams {
    let cli = match Cli::try_parse_from(known_args()) {
        Ok(cli) => cli,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp => {
            print!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let Some(udid) = cli.udid else {
        eprintln!("error: {}", ServerError::BadArgument("--udid is required".into()));
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    SessionParams::new(udid, cli.fps, cli.quality, cli.port)
}

// ── Entry point ──────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // stdout is the machine contract; everything diagnostic goes to
    // stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let params = parse_cli();

    if let Err(e) = run(params).await {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
}

async fn run(params: SessionParams) -> Result<(), ServerError> {
    info!("simulator-server v{}", env!("CARGO_PKG_VERSION"));
    match serde_json::to_string(&params) {
        Ok(json) => info!("session parameters {json}"),
        Err(e) => info!("session parameters unavailable ({e}): {params:?}"),
    }

    // Components come up leaves-first: bridge, server, encoder slot
    // (inside the pipeline), injector, then the command reader.
    let (surface_tx, surface_rx) = mpsc::channel(SURFACE_CHANNEL_DEPTH);
    let bridge = DeviceBridge::start(&params.udid, params.fps, surface_tx)?;

    let ring = Arc::new(FrameRing::new(DEFAULT_CAPACITY));
    let server = Arc::new(MjpegServer::start(params.port, ring).await?);

    let stats = PipelineStats::new();
    tokio::spawn(run_pipeline(
        surface_rx,
        Arc::clone(&server),
        params.quality,
        Arc::clone(&stats),
        true,
    ));

    let injector = HidInjector::start(&params.udid)?;

    let fps_enabled = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = mpsc::channel(16);
    CommandReader::spawn(tokio::io::stdin(), command_tx);
    tokio::spawn(dispatch_commands(
        command_rx,
        injector,
        Arc::clone(&fps_enabled),
        bridge,
        Arc::clone(&server),
    ));

    // Public handshake: external orchestrators block on this line.
    emit_stdout(&format!("stream_ready {}", server.url()));

    pacing_loop(&params, &stats, &fps_enabled).await
}

/// One line to stdout, flushed immediately.
fn emit_stdout(line: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

// ── Command dispatch ─────────────────────────────────────────────

/// Serial dispatcher for parsed stdin commands. Owns the bridge so
/// `shutdown` can release the subscription before exiting.
async fn dispatch_commands(
    mut commands: mpsc::Receiver<Command>,
    injector: HidInjector,
    fps_enabled: Arc<AtomicBool>,
    mut bridge: DeviceBridge,
    server: Arc<MjpegServer>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Touch { phase, points } => injector.send_touch(phase, &points),
            Command::Button { name, direction } => injector.send_button(name, direction),
            Command::Key { code, direction } => injector.send_key(code, direction),
            Command::Rotate(rotation) => {
                info!("rotate to {rotation:?} requested; orientation control not implemented");
            }
            Command::Fps(enabled) => {
                info!("fps reporting {}", if enabled { "enabled" } else { "disabled" });
                fps_enabled.store(enabled, Ordering::SeqCst);
            }
            Command::Shutdown => {
                info!("shutdown requested; releasing resources");
                bridge.stop();
                server.stop();
                std::process::exit(0);
            }
            Command::Unknown(_) => {
                // Already logged at parse time.
            }
        }
    }
    debug!("command stream ended; process continues serving");
}

// ── Pacing loop ──────────────────────────────────────────────────

/// Absolute-deadline pacing on the main task. The last millisecond of
/// every tick is spin-waited for accuracy; the loop never suspends on
/// client or stdin I/O. Reports go out at ~1 Hz while enabled.
async fn pacing_loop(
    params: &SessionParams,
    stats: &PipelineStats,
    fps_enabled: &AtomicBool,
) -> Result<(), ServerError> {
    const SPIN_WINDOW: Duration = Duration::from_millis(1);

    let started = Instant::now();
    let period = params.frame_interval();
    let mut deadline = started + period;
    let mut window_started = started;
    let mut window_encoded = 0u64;

    loop {
        let sleep_until = deadline.checked_sub(SPIN_WINDOW).unwrap_or(deadline);
        if sleep_until > Instant::now() {
            tokio::time::sleep_until(tokio::time::Instant::from_std(sleep_until)).await;
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
        deadline += period;

        if fps_enabled.load(Ordering::SeqCst) {
            let window = window_started.elapsed();
            if window >= Duration::from_secs(1) {
                let (frames_in, encoded) = stats.snapshot();
                let rate = (encoded - window_encoded) as f64 / window.as_secs_f64();
                let report =
                    FpsReport::new(frames_in, encoded, rate, started.elapsed().as_secs_f64());
                emit_stdout(&report.to_line());
                window_started = Instant::now();
                window_encoded = encoded;
            }
        } else {
            // Keep the window fresh so re-enabling does not report a
            // stale average.
            let (_, encoded) = stats.snapshot();
            window_started = Instant::now();
            window_encoded = encoded;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_params_clamp_through_cli_values() {
        let p = SessionParams::new("UDID".into(), Some(999), Some(2.0), Some(0));
        assert_eq!(p.fps, 120);
        assert!((p.quality - 1.0).abs() < f32::EPSILON);

        let p = SessionParams::new("UDID".into(), Some(0), Some(0.0), None);
        assert_eq!(p.fps, 1);
        assert!((p.quality - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn cli_parses_known_flags() {
        let cli = Cli::try_parse_from([
            "simulator-server",
            "--udid",
            "ABC-123",
            "--fps",
            "30",
            "--quality",
            "0.5",
            "--port",
            "8081",
        ])
        .unwrap();
        assert_eq!(cli.udid.as_deref(), Some("ABC-123"));
        assert_eq!(cli.fps, Some(30));
        assert_eq!(cli.quality, Some(0.5));
        assert_eq!(cli.port, Some(8081));
    }

    #[test]
    fn cli_tolerates_missing_optionals() {
        let cli = Cli::try_parse_from(["simulator-server", "--udid", "X"]).unwrap();
        assert!(cli.fps.is_none());
        assert!(cli.quality.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn handshake_line_shape() {
        let line = format!("stream_ready http://127.0.0.1:{}/stream.mjpeg", 49152);
        let url = line.strip_prefix("stream_ready ").unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.ends_with("/stream.mjpeg"));
    }
}
