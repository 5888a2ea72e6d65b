use std::io::{self, BufRead};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use audiovisor::cli::SessionArgs;
use audiovisor::prelude::*;
use audiovisor::stats::rms_to_db;

#[derive(Parser)]
#[command(name = "audiovisor", version, about = "Pair AudioVisor sensors and print live levels")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    /// Pair a device of this kind at startup: `lr` or `ud` (repeatable).
    #[arg(long = "pair", value_name = "KIND")]
    pair: Vec<DeviceKind>,

    /// Log every notification as hex before it is decoded.
    #[arg(long)]
    raw: bool,

    /// Seconds between level reports.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,
}

fn fmt_db(db: f64) -> String {
    if db.is_finite() {
        format!("{db:+6.1} dB")
    } else {
        "  -inf dB".into()
    }
}

fn print_levels(sessions: &SessionManager) {
    let state = sessions.state();
    if state.is_empty() {
        return;
    }
    for s in state.sessions.values() {
        let latest = s.buffers.level_source().and_then(|b| b.latest()).unwrap_or(0.0);
        println!(
            "[{:9}] {:24} frames={:6} dropped={:3}  sample={latest:+7.3}  rms={}  avg={}",
            s.kind.label(),
            s.label(),
            s.frames,
            s.dropped,
            fmt_db(s.latest_db()),
            fmt_db(rms_to_db(s.average_rms())),
        );
    }
}

fn spawn_connect(sessions: &SessionManager, kind: DeviceKind) {
    let sessions = sessions.clone();
    tokio::spawn(async move {
        info!("Pairing a {} device …", kind.label());
        match sessions.connect(kind).await {
            Some(id) => {
                info!("✅  Connected: {id}");
                sessions.resend_controls(Some(&id)).await;
            }
            None => error!(
                "❌  Pairing failed: {}",
                sessions.status().unwrap_or_else(|| "unknown error".into())
            ),
        }
    });
}

/// Resolve a user-typed id prefix or suffix to a connected session.
fn find_session(sessions: &SessionManager, needle: &str) -> Option<SessionId> {
    let needle = needle.to_ascii_lowercase();
    sessions.session_ids().into_iter().find(|id| {
        let s = id.as_str().to_ascii_lowercase();
        s == needle || s.starts_with(&needle) || s.ends_with(&needle)
    })
}

async fn apply_controls(sessions: &SessionManager, store: &SettingsStore, next: ControlSettings) {
    sessions.update_controls(next, None).await;
    if let Err(e) = store.save_control_settings(next) {
        warn!("Could not save settings: {e:#}");
    }
    info!("sensitivity={}  brightness={}", next.sensitivity, next.brightness);
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=audiovisor=debug cargo run -- --simulate --pair lr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = cli.session.config();
    let transport = cli.session.transport(&config);
    let store = SettingsStore::new(&cli.session.settings).with_context(|| {
        format!("opening settings file {}", cli.session.settings.display())
    })?;
    let sessions = SessionManager::new(transport, config);
    // Nothing is connected yet; this only records the starting values.
    sessions.update_controls(store.control_settings(), None).await;

    if cli.raw {
        let mut raw = sessions.subscribe_raw();
        tokio::spawn(async move {
            loop {
                match raw.recv().await {
                    Ok(p) => info!("{} raw {:02x?}", p.id.short(), &p.bytes[..]),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("raw tap skipped {n} payloads")
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    for kind in &cli.pair {
        spawn_connect(&sessions, *kind);
    }

    info!("Commands (type + Enter):");
    info!("  c lr|ud   – pair another device");
    info!("  d [id]    – disconnect one device, or all");
    info!("  s <0-100> – set sensitivity");
    info!("  b <0-255> – set LED brightness");
    info!("  r         – re-send controls to every device");
    info!("  l         – list devices");
    info!("  x <hex>   – send raw bytes to every device");
    info!("  q         – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held across
    // an await point.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut report = tokio::time::interval(Duration::from_secs_f64(cli.interval.max(0.1)));

    loop {
        tokio::select! {
            _ = report.tick() => print_levels(&sessions),
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let mut parts = line.split_whitespace();
                let (Some(cmd), arg) = (parts.next(), parts.next()) else { continue };
                match cmd {
                    "q" => break,
                    "c" => match arg.unwrap_or("lr").parse::<DeviceKind>() {
                        Ok(kind) => spawn_connect(&sessions, kind),
                        Err(e) => error!("{e}"),
                    },
                    "d" => match arg {
                        None => sessions.disconnect(None).await,
                        Some(needle) => match find_session(&sessions, needle) {
                            Some(id) => sessions.disconnect(Some(&id)).await,
                            None => warn!("No connected device matches '{needle}'"),
                        },
                    },
                    "s" | "b" => match arg.and_then(|a| a.parse::<i64>().ok()) {
                        Some(v) => {
                            let current = sessions.controls();
                            let next = if cmd == "s" {
                                current.with_sensitivity(v)
                            } else {
                                current.with_brightness(v)
                            };
                            apply_controls(&sessions, &store, next).await;
                        }
                        None => error!("'{cmd}' needs a number"),
                    },
                    "r" => sessions.resend_controls(None).await,
                    "l" => {
                        let ids = sessions.session_ids();
                        if ids.is_empty() {
                            println!("(no devices)");
                        }
                        for id in ids {
                            if let Some(s) = sessions.session(&id) {
                                println!("{id}  {}  {}", s.kind.label(), s.name.as_deref().unwrap_or("-"));
                            }
                        }
                    }
                    "x" => {
                        let hex: String = line[1..].chars().filter(|c| !c.is_whitespace()).collect();
                        let bytes: Option<Vec<u8>> = (0..hex.len())
                            .step_by(2)
                            .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
                            .collect();
                        match bytes {
                            Some(b) if !b.is_empty() => {
                                if !sessions.send(&b, None).await {
                                    error!("Send failed: {}", sessions.status().unwrap_or_default());
                                }
                            }
                            _ => error!("'x' needs an even number of hex digits"),
                        }
                    }
                    other => warn!("Unknown command '{other}'"),
                }
            }
        }
    }

    info!("Disconnecting …");
    sessions.disconnect(None).await;
    Ok(())
}
