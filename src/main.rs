//! livecast agent
//!
//! Drives a publisher (or, with `--play`, a player) against the in-process
//! loopback engine from line commands on stdin. Every session event is
//! logged and echoed as JSON.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use livecast::engine::loopback::{LoopbackConnector, LoopbackPlayer, LoopbackPublisher};
use livecast::logging::{init_logging, log_dir};
use livecast::{Config, PlayerHandle, PublisherHandle, SessionRegistry};

enum Input {
    Line(String),
    Shutdown,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let play_mode = args.iter().any(|a| a == "--play" || a == "-p");
    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    // Logging settings live in the config, so it is read first
    let config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let _log_guard = init_logging(&config.logging)?;
    info!("livecast agent starting...");
    info!("Configuration loaded from {:?}", config.config_path()?);
    if let Ok(dir) = log_dir(&config.logging) {
        debug!("Logging to {:?}", dir);
    }

    let runtime = Arc::new(tokio::runtime::Runtime::new().context("Failed to start runtime")?);
    let registry = Arc::new(SessionRegistry::new(config));

    let (input_tx, input_rx) = mpsc::unbounded_channel();

    // Set up Ctrl+C handler that sends shutdown
    let ctrl_c_tx = input_tx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = ctrl_c_tx.send(Input::Shutdown);
    })?;

    // stdin is blocking; read it on its own thread
    let stdin_tx = input_tx;
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if stdin_tx.send(Input::Line(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        let _ = stdin_tx.send(Input::Shutdown);
    });

    let loop_registry = registry.clone();
    runtime.block_on(async move {
        if play_mode {
            run_player(&loop_registry, input_rx).await
        } else {
            run_publisher(&loop_registry, input_rx).await
        }
    });

    registry.shutdown_all();
    // Give owner tasks a moment to finish teardown
    runtime.block_on(tokio::time::sleep(Duration::from_millis(100)));

    info!("Shutdown complete");
    Ok(())
}

async fn run_publisher(registry: &SessionRegistry, mut input_rx: mpsc::UnboundedReceiver<Input>) {
    let (engine, mut control) = LoopbackPublisher::new();
    let handle = registry.create_publisher(
        Box::new(engine.with_auto_connect()),
        Arc::new(LoopbackConnector::new()),
    );
    spawn_event_log(handle.events());

    // Synthetic encoder output at 30 fps; the loopback engine ignores it
    // unless a session is streaming
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(33));
        let mut pts_us = 0u64;
        loop {
            ticker.tick().await;
            if !control.emit_frame(pts_us, pts_us % 2_000_000 < 33_000) {
                break;
            }
            pts_us += 33_333;
            for call in control.drain_calls() {
                debug!("engine <- {:?}", call);
            }
        }
    });

    println!("publisher ready; type 'help' for commands");
    while let Some(input) = input_rx.recv().await {
        let line = match input {
            Input::Line(line) => line,
            Input::Shutdown => break,
        };
        if !publisher_command(&handle, line.trim()).await {
            break;
        }
    }
}

/// Returns false on quit
async fn publisher_command(handle: &PublisherHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };
    let rest: Vec<String> = parts.map(str::to_string).collect();

    match cmd {
        "start" => handle.start(rest.first().map(String::as_str)),
        "stop" => handle.stop(),
        "switch" => match handle.switch_camera_checked().await {
            Some(Ok(facing)) => println!("camera: {:?}", facing),
            Some(Err(e)) => println!("switch rejected: {}", e),
            None => return false,
        },
        "flash" => handle.toggle_flash(),
        "mute" => handle.toggle_mute(),
        "zoom" => match rest.first().and_then(|v| v.parse::<f32>().ok()) {
            Some(level) => handle.set_zoom(level),
            None => println!("usage: zoom <0..1>"),
        },
        "exposure" => match rest.first().and_then(|v| v.parse::<f32>().ok()) {
            Some(value) => handle.set_exposure(value),
            None => println!("usage: exposure <-1..1>"),
        },
        "filter" => handle.set_filter(rest.first().map(String::as_str).unwrap_or("none")),
        "bg" => handle.background(),
        "fg" => handle.foreground(),
        "multi" => handle.start_multi(rest),
        "stopmulti" => handle.stop_multi(),
        "rec" => match handle.start_recording().await {
            Some(path) => println!("recording to {}", path.display()),
            None => println!("recording unavailable"),
        },
        "stoprec" => handle.stop_recording(),
        "ack" => handle.acknowledge(),
        "stats" => {
            if let Some(stats) = handle.statistics().await {
                println!(
                    "{} for {} ({} bytes, {} destinations)",
                    stats.bitrate_formatted,
                    stats.duration_formatted,
                    stats.total_bytes_sent,
                    stats.destinations
                );
            }
        }
        "snap" => print_json(handle.snapshot().await),
        "help" => print_commands(false),
        "quit" | "exit" => return false,
        other => println!("unknown command '{}'", other),
    }
    true
}

async fn run_player(registry: &SessionRegistry, mut input_rx: mpsc::UnboundedReceiver<Input>) {
    let (engine, mut control) = LoopbackPlayer::new();
    let handle = registry.create_player(Box::new(engine.with_auto_play()));
    spawn_event_log(handle.events());

    tokio::spawn(async move {
        while let Some(call) = control.next_call().await {
            debug!("engine <- {:?}", call);
        }
    });

    println!("player ready; type 'help' for commands");
    while let Some(input) = input_rx.recv().await {
        let line = match input {
            Input::Line(line) => line,
            Input::Shutdown => break,
        };
        if !player_command(&handle, line.trim()).await {
            break;
        }
    }
}

/// Returns false on quit
async fn player_command(handle: &PlayerHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };
    let arg = parts.next();

    match cmd {
        "play" => handle.play(arg),
        "pause" => handle.pause(),
        "resume" => handle.resume(),
        "stop" => handle.stop(),
        "seek" => match arg.and_then(|v| v.parse::<u64>().ok()) {
            Some(ms) => handle.seek_to(ms),
            None => println!("usage: seek <ms>"),
        },
        "vol" => match arg.and_then(|v| v.parse::<f32>().ok()) {
            Some(volume) => handle.set_volume(volume),
            None => println!("usage: vol <0..1>"),
        },
        "mute" => handle.set_muted(true),
        "unmute" => handle.set_muted(false),
        "rate" => match arg.and_then(|v| v.parse::<f32>().ok()) {
            Some(rate) => handle.set_rate(rate),
            None => println!("usage: rate <x>"),
        },
        "bg" => handle.background(),
        "fg" => handle.foreground(),
        "ack" => handle.acknowledge(),
        "pos" => {
            let position = handle.position().await.unwrap_or(0);
            let duration = handle.duration().await.unwrap_or(0);
            println!("{} / {} ms", position, duration);
        }
        "snap" => print_json(handle.snapshot().await),
        "help" => print_commands(true),
        "quit" | "exit" => return false,
        other => println!("unknown command '{}'", other),
    }
    true
}

fn spawn_event_log(
    mut events: tokio_stream::wrappers::BroadcastStream<livecast::SessionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    info!("event: {:?}", event);
                    println!("{}", event.to_json());
                }
                Err(e) => warn!("Event log fell behind: {}", e),
            }
        }
    });
}

fn print_json<T: serde::Serialize>(value: Option<T>) {
    let Some(value) = value else {
        return;
    };
    match serde_json::to_string_pretty(&value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize: {}", e),
    }
}

fn print_commands(player: bool) {
    if player {
        println!("play [url] | pause | resume | stop | seek <ms> | vol <0..1> | mute | unmute");
        println!("rate <x> | bg | fg | ack | pos | snap | quit");
    } else {
        println!("start [url] | stop | switch | flash | mute | zoom <0..1> | exposure <-1..1>");
        println!("filter <name> | bg | fg | multi <url>... | stopmulti | rec | stoprec");
        println!("ack | stats | snap | quit");
    }
}

fn print_help() {
    println!("livecast agent - live-stream session lifecycle demo");
    println!();
    println!("USAGE:");
    println!("    livecast-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help            Print this help message");
    println!("    -p, --play            Run a player instead of a publisher");
    println!("    -c, --config <PATH>   Use this config file instead of the default");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG              Set log level (e.g., debug, info, warn)");
    println!("    LIVECAST_LOG_PATH     Override the log directory");
}
