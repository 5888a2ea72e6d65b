//! Real-time dashboard for AudioVisor sensors.
//!
//! Usage:
//!   cargo run --bin tui                          # pair an L/R sensor over BLE
//!   cargo run --bin tui -- --pair lr --pair ud   # pair two sensors at startup
//!   cargo run --bin tui -- --simulate            # generated data, no hardware needed
//!
//! Keys (dashboard)
//! ----------------
//!   1 / 2    pair another L/R / Up-Behind sensor
//!   Tab      open device list
//!   n        select next device
//!   d        disconnect selected device
//!   D        disconnect every device
//!   [ / ]    sensitivity −5 / +5
//!   , / .    LED brightness −16 / +16
//!   r        re-send controls to the selected device
//!   +  / =   zoom out
//!   -        zoom in
//!   a        auto-scale: fit Y axis to current peak amplitude
//!   v        toggle smooth overlay
//!   p        freeze / unfreeze the display
//!   q / Esc  quit
//!
//! Keys (device list overlay)
//! --------------------------
//!   ↑ / ↓   navigate list
//!   Enter    select highlighted device
//!   d        disconnect highlighted device
//!   Esc      close list

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{
        Axis, Block, Borders, Chart, Clear, Dataset, Gauge, GraphType, List, ListItem, ListState,
        Paragraph,
    },
    Frame, Terminal,
};
use tokio::sync::mpsc;

use audiovisor::cli::SessionArgs;
use audiovisor::prelude::*;
use audiovisor::stats::rms;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Discrete Y-axis half-ranges for the waveform charts (normalized units).
const Y_SCALES: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Float firmware peaks near ±1 after normalization.
const DEFAULT_SCALE: usize = 4;

const SENSITIVITY_STEP: i64 = 5;
const BRIGHTNESS_STEP: i64 = 16;

/// Floor of the level gauge.
const GAUGE_FLOOR_DB: f64 = -60.0;

/// Moving-average window in samples for the smooth overlay.
const SMOOTH_WINDOW: usize = 5;

/// Braille spinner frames cycled at ~100 ms intervals to indicate background activity.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn channel_color(ch: Channel) -> Color {
    match ch {
        Channel::Left => Color::Cyan,
        Channel::Right => Color::Yellow,
        Channel::Up => Color::Green,
        Channel::Down => Color::Magenta,
    }
}

/// Dimmed trace colour used under the smooth overlay.
fn channel_dim_color(ch: Channel) -> Color {
    match ch {
        Channel::Left => Color::Rgb(0, 90, 110),
        Channel::Right => Color::Rgb(110, 90, 0),
        Channel::Up => Color::Rgb(0, 110, 0),
        Channel::Down => Color::Rgb(110, 0, 110),
    }
}

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tui", version, about = "Live AudioVisor sensor dashboard")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    /// Pair a device of this kind at startup: `lr` or `ud` (repeatable).
    #[arg(long = "pair", value_name = "KIND", default_values_t = [DeviceKind::Lr])]
    pair: Vec<DeviceKind>,
}

// ── View: one frame's worth of data, copied out of the registry ───────────────

struct ChannelView {
    channel: Channel,
    points: Vec<(f64, f64)>,
    min: f64,
    max: f64,
    rms: f64,
}

struct View {
    id: SessionId,
    label: String,
    kind: DeviceKind,
    has_write: bool,
    capacity: usize,
    channels: Vec<ChannelView>,
    spectrum_channel: Option<Channel>,
    spectrum: Vec<(f64, f64)>,
    latest_db: f64,
    average_db: f64,
    average_rms: f64,
    window: Duration,
    frames: u64,
    dropped: u64,
}

/// `capacity` is the X range used until the first buffer exists.
fn build_view(session: &SessionSnapshot, capacity: usize) -> View {
    let capacity = session
        .buffers
        .channels()
        .find_map(|ch| session.buffers.get(ch))
        .map_or(capacity, |b| b.capacity());
    let mut channels: Vec<ChannelView> = session
        .buffers
        .channels()
        .filter_map(|ch| session.buffers.get(ch).map(|b| (ch, b.to_vec())))
        .map(|(channel, samples)| {
            let (min, max) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(f64::from(v)), hi.max(f64::from(v)))
            });
            ChannelView {
                channel,
                points: samples
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| (i as f64, f64::from(v)))
                    .collect(),
                min: if samples.is_empty() { 0.0 } else { min },
                max: if samples.is_empty() { 0.0 } else { max },
                rms: rms(&samples, 1.0),
            }
        })
        .collect();

    // Show the device's own pair first.
    let primary = session.kind.primary_channels();
    channels.sort_by_key(|c| !primary.contains(&c.channel));

    let spectrum_channel = primary
        .into_iter()
        .chain(Channel::ALL)
        .find(|&ch| session.buffers.get(ch).is_some_and(|b| !b.is_empty()));
    let spectrum = spectrum_channel
        .map(|ch| session.spectrum(ch))
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(k, m)| (k as f64, m))
        .collect();

    View {
        id: session.id.clone(),
        label: session.label(),
        kind: session.kind,
        has_write: session.has_write,
        capacity,
        channels,
        spectrum_channel,
        spectrum,
        latest_db: session.latest_db(),
        average_db: session.average_db(),
        average_rms: session.average_rms(),
        window: session.rolling.window(),
        frames: session.frames,
        dropped: session.dropped,
    }
}

/// One row of the device list.
struct DeviceRow {
    id: SessionId,
    text: String,
}

// ── App state (shared with connect tasks via Arc<Mutex<_>>) ───────────────────

pub struct App {
    /// Session shown on the dashboard and targeted by control changes.
    pub selected: Option<SessionId>,
    /// Pairing attempts in flight.
    pub connecting: Vec<DeviceKind>,
    /// Last pairing / command error, shown in the header.
    pub last_error: Option<String>,
    pub controls: ControlSettings,
    pub simulated: bool,

    // ── UI controls
    scale_idx: usize,
    pub smooth: bool,
    /// Snapshot shown while the display is frozen.
    frozen: Option<View>,

    // ── Device list
    pub show_picker: bool,
    pub picker_cursor: usize,

    // ── Rate tracking
    rate: f64,
    rate_mark: Option<(SessionId, Instant, u64)>,
}

impl App {
    fn new(controls: ControlSettings, simulated: bool) -> Self {
        Self {
            selected: None,
            connecting: vec![],
            last_error: None,
            controls,
            simulated,
            scale_idx: DEFAULT_SCALE,
            smooth: true,
            frozen: None,
            show_picker: false,
            picker_cursor: 0,
            rate: 0.0,
            rate_mark: None,
        }
    }

    fn y_range(&self) -> f64 {
        Y_SCALES[self.scale_idx]
    }

    fn scale_up(&mut self) {
        if self.scale_idx + 1 < Y_SCALES.len() {
            self.scale_idx += 1;
        }
    }

    fn scale_down(&mut self) {
        if self.scale_idx > 0 {
            self.scale_idx -= 1;
        }
    }

    /// Smallest scale step that fits the current peak with 10 % headroom.
    fn auto_scale(&mut self, view: Option<&View>) {
        let peak = view
            .map(|v| {
                v.channels
                    .iter()
                    .fold(0.0_f64, |acc, c| acc.max(c.min.abs()).max(c.max.abs()))
            })
            .unwrap_or(0.0);
        let needed = peak * 1.1;
        self.scale_idx = Y_SCALES
            .iter()
            .position(|&s| s >= needed)
            .unwrap_or(Y_SCALES.len() - 1);
    }

    /// Frames per second of the selected device, sampled once a second.
    fn update_rate(&mut self, view: Option<&View>) {
        let Some(view) = view else {
            self.rate = 0.0;
            self.rate_mark = None;
            return;
        };
        let now = Instant::now();
        let mark = self
            .rate_mark
            .as_ref()
            .filter(|(id, _, _)| *id == view.id)
            .map(|&(_, at, frames)| (at, frames));
        match mark {
            Some((at, frames)) => {
                let dt = now.duration_since(at).as_secs_f64();
                if dt >= 1.0 {
                    self.rate = view.frames.saturating_sub(frames) as f64 / dt;
                    self.rate_mark = Some((view.id.clone(), now, view.frames));
                }
            }
            None => {
                self.rate = 0.0;
                self.rate_mark = Some((view.id.clone(), now, view.frames));
            }
        }
    }
}

/// Never call while holding a `sessions.state()` borrow: connect tasks read
/// the registry with this lock held.
fn lock(app: &Mutex<App>) -> MutexGuard<'_, App> {
    app.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Symmetric moving-average (boxcar) smoother, length-preserving.
fn smooth_signal(data: &[(f64, f64)], window: usize) -> Vec<(f64, f64)> {
    if data.len() < 3 || window < 2 {
        return data.to_vec();
    }
    let half = window / 2;
    data.iter()
        .enumerate()
        .map(|(i, &(x, _))| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(data.len());
            let sum: f64 = data[start..end].iter().map(|&(_, y)| y).sum();
            (x, sum / (end - start) as f64)
        })
        .collect()
}

fn fmt_db(db: f64) -> String {
    if db.is_finite() {
        format!("{db:+.1} dB")
    } else {
        "−∞ dB".into()
    }
}

// ── Session commands ──────────────────────────────────────────────────────────

/// Work for the control task. Serialized so the latest change is the last
/// one written.
enum ControlRequest {
    Update(ControlSettings, Option<SessionId>),
    Resend(SessionId),
}

fn spawn_control_task(sessions: SessionManager) -> mpsc::UnboundedSender<ControlRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlRequest>();
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            match req {
                ControlRequest::Update(settings, target) => {
                    sessions.update_controls(settings, target.as_ref()).await;
                }
                ControlRequest::Resend(id) => sessions.resend_controls(Some(&id)).await,
            }
        }
    });
    tx
}

/// Kick off a background pairing attempt and return immediately.
fn start_connect(
    kind: DeviceKind,
    sessions: &SessionManager,
    app: Arc<Mutex<App>>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
) {
    lock(&app).connecting.push(kind);
    let sessions = sessions.clone();
    tokio::spawn(async move {
        let result = sessions.connect(kind).await;
        let status = result.is_none().then(|| sessions.status()).flatten();
        let mut s = lock(&app);
        if let Some(pos) = s.connecting.iter().position(|&k| k == kind) {
            s.connecting.remove(pos);
        }
        match result {
            Some(id) => {
                log::info!("Paired {} as {}", id, kind.label());
                s.last_error = None;
                if s.selected.is_none() {
                    s.selected = Some(id.clone());
                    let _ = control_tx.send(ControlRequest::Resend(id));
                }
            }
            None => s.last_error = status,
        }
    });
}

/// Change the selected session and push the current controls to it.
fn select(app: &Mutex<App>, id: Option<SessionId>, control_tx: &mpsc::UnboundedSender<ControlRequest>) {
    let mut s = lock(app);
    if s.selected == id {
        return;
    }
    s.selected = id.clone();
    s.frozen = None;
    if let Some(id) = id {
        let _ = control_tx.send(ControlRequest::Resend(id));
    }
}

fn change_controls(
    app: &Mutex<App>,
    store: &SettingsStore,
    control_tx: &mpsc::UnboundedSender<ControlRequest>,
    f: impl FnOnce(ControlSettings) -> ControlSettings,
) {
    let (next, target) = {
        let mut s = lock(app);
        let next = f(s.controls);
        if next == s.controls {
            return;
        }
        s.controls = next;
        (next, s.selected.clone())
    };
    if let Err(e) = store.save_control_settings(next) {
        log::warn!("Could not save settings: {e:#}");
    }
    let _ = control_tx.send(ControlRequest::Update(next, target));
}

fn disconnect(sessions: &SessionManager, id: Option<SessionId>) {
    let sessions = sessions.clone();
    // Fire-and-forget: never block the main loop on a BLE call.
    tokio::spawn(async move { sessions.disconnect(id.as_ref()).await });
}

/// Copy what one frame needs out of the registry.
///
/// Also moves the selection off a session that vanished (unsolicited
/// disconnect) onto the first remaining one.
fn read_frame(
    sessions: &SessionManager,
    app: &Mutex<App>,
    control_tx: &mpsc::UnboundedSender<ControlRequest>,
    capacity: usize,
) -> (Vec<DeviceRow>, Option<View>) {
    let selected = lock(app).selected.clone();
    let (devices, fallback) = {
        let state = sessions.state();
        let devices: Vec<DeviceRow> = state
            .sessions
            .values()
            .map(|s| DeviceRow {
                id: s.id.clone(),
                text: format!(
                    "{}  [{}]  {} frames  up {}s",
                    s.label(),
                    s.kind.label(),
                    s.frames,
                    s.connected_at.elapsed().as_secs()
                ),
            })
            .collect();
        let fallback = match &selected {
            Some(id) if state.contains(id) => None,
            Some(_) | None => Some(state.ids().next().cloned()),
        };
        (devices, fallback)
    };
    if let Some(next) = fallback {
        if next != selected {
            select(app, next, control_tx);
        }
    }

    let selected = lock(app).selected.clone();
    let state = sessions.state();
    let live = selected.and_then(|id| state.get(&id).map(|s| build_view(s, capacity)));
    (devices, live)
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// Header / charts / footer, plus the device list overlay when open.
fn draw(frame: &mut Frame, app: &App, view: Option<&View>, devices: &[DeviceRow]) {
    let area = frame.area();
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(4),
    ])
    .split(area);

    draw_header(frame, root[0], app, view, devices.len());
    draw_body(frame, root[1], app, view);
    draw_footer(frame, root[2], app);

    if app.show_picker {
        draw_device_picker(frame, area, app, devices);
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

/// Status bar: title, selected device, pairing activity, controls, rate.
fn draw_header(frame: &mut Frame, area: Rect, app: &App, view: Option<&View>, n_devices: usize) {
    let (label, color) = match (view, app.connecting.first()) {
        (Some(v), _) => {
            let prefix = if app.simulated { "◆" } else { "●" };
            (format!("{prefix} {} [{}]", v.label, v.kind.label()), Color::Green)
        }
        (None, Some(kind)) => (
            format!("{} Pairing {} sensor…", spinner_str(), kind.label()),
            Color::Yellow,
        ),
        (None, None) => match &app.last_error {
            Some(e) => (format!("✖ {e}"), Color::Red),
            None => ("No device: press [1] or [2] to pair".to_owned(), Color::Yellow),
        },
    };

    let mut spans = vec![
        Span::styled(
            " AudioVisor ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ];
    if view.is_some() && !app.connecting.is_empty() {
        spans.push(Span::styled(
            format!("  {} pairing {}", spinner_str(), app.connecting.len()),
            Style::default().fg(Color::Yellow),
        ));
    }
    spans.extend([
        sep(),
        Span::styled(format!("{n_devices} dev"), Style::default().fg(Color::White)),
        sep(),
        Span::styled(
            format!("Sens {}", app.controls.sensitivity),
            Style::default().fg(Color::LightBlue).add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(
            format!("LED {}", app.controls.brightness),
            Style::default().fg(Color::LightBlue).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(format!("{:.0} fr/s", app.rate), Style::default().fg(Color::White)),
        sep(),
        Span::styled(format!("±{}", app.y_range()), Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
    ]);

    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

// ── Body ──────────────────────────────────────────────────────────────────────

fn draw_body(frame: &mut Frame, area: Rect, app: &App, view: Option<&View>) {
    let [waves, side] =
        Layout::horizontal([Constraint::Percentage(65), Constraint::Percentage(35)]).areas(area);
    let [spectrum, level] =
        Layout::vertical([Constraint::Percentage(60), Constraint::Percentage(40)]).areas(side);

    draw_waveforms(frame, waves, app, view);
    draw_spectrum(frame, spectrum, view);
    draw_level(frame, level, view);
}

/// One waveform chart per channel that has data, stacked vertically.
fn draw_waveforms(frame: &mut Frame, area: Rect, app: &App, view: Option<&View>) {
    let Some(view) = view.filter(|v| !v.channels.is_empty()) else {
        let text = if view.is_some() {
            " Waiting for samples…"
        } else {
            " No device selected"
        };
        frame.render_widget(
            Paragraph::new(Span::styled(text, Style::default().fg(Color::DarkGray)))
                .block(Block::default().title(" Waveform ").borders(Borders::ALL)),
            area,
        );
        return;
    };

    let n = view.channels.len() as u32;
    let rows = Layout::vertical((0..n).map(|_| Constraint::Ratio(1, n))).split(area);
    for (c, row) in view.channels.iter().zip(rows.iter()) {
        draw_channel(frame, *row, c, view.capacity, app);
    }
}

/// A single channel chart: title with min/max/RMS, red border when clipping.
fn draw_channel(frame: &mut Frame, area: Rect, c: &ChannelView, capacity: usize, app: &App) {
    let color = channel_color(c.channel);
    let y_range = app.y_range();
    let clipping = c.max > y_range || c.min < -y_range;
    let border_color = if clipping { Color::Red } else { color };

    // Out-of-range points would otherwise be dropped by the chart.
    let data: Vec<(f64, f64)> = c
        .points
        .iter()
        .map(|&(x, y)| (x, y.clamp(-y_range, y_range)))
        .collect();

    let clip_tag = if clipping { " [CLIP +]" } else { "" };
    let smooth_tag = if app.smooth { " [SMOOTH]" } else { "" };
    let title = format!(
        " {}  min:{:+.3}  max:{:+.3}  rms:{:.3}{clip_tag}{smooth_tag} ",
        c.channel, c.min, c.max, c.rms
    );

    let y_labels: Vec<String> = [-1.0, 0.0, 1.0]
        .iter()
        .map(|&f| format!("{:+}", f * y_range))
        .collect();
    let x_max = capacity.max(1) as f64;
    let x_labels = vec!["0".to_string(), format!("{capacity} smp")];

    let smoothed: Vec<(f64, f64)> = if app.smooth {
        smooth_signal(&data, SMOOTH_WINDOW)
    } else {
        vec![]
    };

    let datasets: Vec<Dataset> = if app.smooth {
        vec![
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(channel_dim_color(c.channel)))
                .data(&data),
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(color))
                .data(&smoothed),
        ]
    } else {
        vec![Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(color))
            .data(&data)]
    };

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    title,
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border_color)),
        )
        .x_axis(
            Axis::default()
                .bounds([0.0, x_max])
                .labels(x_labels)
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([-y_range, y_range])
                .labels(y_labels)
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}

fn draw_spectrum(frame: &mut Frame, area: Rect, view: Option<&View>) {
    let (title, data, color) = match view.and_then(|v| v.spectrum_channel.map(|ch| (v, ch))) {
        Some((v, ch)) => (
            format!(" Spectrum ({ch}, {} bins) ", v.spectrum.len()),
            v.spectrum.as_slice(),
            channel_color(ch),
        ),
        None => (" Spectrum ".to_string(), &[][..], Color::DarkGray),
    };
    let peak = data.iter().fold(0.0_f64, |acc, &(_, m)| acc.max(m));
    let y_max = if peak > 0.0 { peak * 1.1 } else { 1.0 };
    let x_max = (data.len().max(2) - 1) as f64;

    let chart = Chart::new(vec![Dataset::default()
        .marker(symbols::Marker::HalfBlock)
        .graph_type(GraphType::Bar)
        .style(Style::default().fg(color))
        .data(data)])
    .block(Block::default().title(title).borders(Borders::ALL))
    .x_axis(
        Axis::default()
            .bounds([0.0, x_max])
            .labels(vec!["DC".to_string(), format!("bin {}", x_max as usize)])
            .style(Style::default().fg(Color::DarkGray)),
    )
    .y_axis(
        Axis::default()
            .bounds([0.0, y_max])
            .labels(vec!["0".to_string(), format!("{y_max:.3}")])
            .style(Style::default().fg(Color::DarkGray)),
    );
    frame.render_widget(chart, area);
}

/// Current level gauge plus the rolling-window average.
fn draw_level(frame: &mut Frame, area: Rect, view: Option<&View>) {
    let block = Block::default().title(" Level ").borders(Borders::ALL);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let Some(v) = view else {
        return;
    };
    let [gauge_area, text_area] =
        Layout::vertical([Constraint::Length(1), Constraint::Min(0)]).areas(inner);

    let ratio = if v.latest_db.is_finite() {
        ((v.latest_db - GAUGE_FLOOR_DB) / -GAUGE_FLOOR_DB).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let gauge_color = if ratio > 0.9 { Color::Red } else { Color::Green };
    frame.render_widget(
        Gauge::default()
            .gauge_style(Style::default().fg(gauge_color))
            .ratio(ratio)
            .label(fmt_db(v.latest_db)),
        gauge_area,
    );

    let minutes = v.window.as_secs_f64() / 60.0;
    let dim = Style::default().fg(Color::DarkGray);
    let lines = vec![
        Line::from(vec![
            Span::styled(format!(" {minutes:.0}-min avg  "), dim),
            Span::styled(
                fmt_db(v.average_db),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  (rms {:.4})", v.average_rms), dim),
        ]),
        Line::from(vec![
            Span::styled(" Frames  ", dim),
            Span::raw(v.frames.to_string()),
            Span::styled("   Dropped  ", dim),
            Span::styled(
                v.dropped.to_string(),
                Style::default().fg(if v.dropped > 0 { Color::Yellow } else { Color::White }),
            ),
        ]),
        Line::from(if v.has_write {
            Span::styled(" Commands enabled", dim)
        } else {
            Span::styled(" No write characteristic: commands disabled", Style::default().fg(Color::Red))
        }),
    ];
    frame.render_widget(Paragraph::new(lines), text_area);
}

// ── Footer ────────────────────────────────────────────────────────────────────

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let frozen_span = if app.frozen.is_some() {
        Span::styled(
            "  ⏸ FROZEN",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )
    } else {
        Span::raw("")
    };

    let keys = Line::from(vec![
        Span::raw(" "),
        key("[1]"),
        Span::raw("Pair L/R  "),
        key("[2]"),
        Span::raw("Pair Up/Behind  "),
        key("[Tab]"),
        Span::raw("Devices  "),
        key("[n]"),
        Span::raw("Next  "),
        key("[d]"),
        Span::raw("Disconnect  "),
        key("[D]"),
        Span::raw("All  "),
        key("[q]"),
        Span::raw("Quit"),
        frozen_span,
    ]);
    let controls = Line::from(vec![
        Span::raw(" "),
        key("[ ]"),
        Span::raw("Sensitivity  "),
        key("[, .]"),
        Span::raw("LED  "),
        key("[r]"),
        Span::raw("Resend  "),
        key("[+ -]"),
        Span::raw("Scale  "),
        key("[a]"),
        Span::raw("Auto-scale  "),
        key("[v]"),
        Span::raw(if app.smooth { "Raw  " } else { "Smooth  " }),
        key("[p]"),
        Span::raw("Freeze"),
    ]);

    frame.render_widget(
        Paragraph::new(vec![keys, controls]).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

// ── Device list overlay ───────────────────────────────────────────────────────

/// Centered modal listing every paired session; the selected one is green.
fn draw_device_picker(frame: &mut Frame, area: Rect, app: &App, devices: &[DeviceRow]) {
    let n = devices.len().max(1);
    let inner_h = n as u16 + 4;
    let box_h = inner_h + 2;
    let box_w = (area.width * 60 / 100).max(52).min(area.width);
    let x = area.x + (area.width.saturating_sub(box_w)) / 2;
    let y = area.y + (area.height.saturating_sub(box_h)) / 2;
    let popup = Rect::new(x, y, box_w, box_h.min(area.height));

    frame.render_widget(Clear, popup);

    let title = if app.connecting.is_empty() {
        format!(" Devices  ({} paired) ", devices.len())
    } else {
        format!(" {} Pairing…  ({} paired) ", spinner_str(), devices.len())
    };

    frame.render_widget(
        Block::default()
            .title(Span::styled(
                title,
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
        popup,
    );

    let inner = popup.inner(Margin {
        horizontal: 1,
        vertical: 1,
    });

    let hint_h = 1u16;
    let [list_area, _, hint_area] = Layout::vertical([
        Constraint::Length(inner.height.saturating_sub(hint_h + 1)),
        Constraint::Length(1),
        Constraint::Length(hint_h),
    ])
    .areas(inner);

    let items: Vec<ListItem> = if devices.is_empty() {
        vec![ListItem::new(Span::styled(
            "  No devices paired: press [1] or [2]",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        devices
            .iter()
            .map(|d| {
                let selected = app.selected.as_ref() == Some(&d.id);
                let (bullet, color, suffix) = if selected {
                    ("● ", Color::Green, "  ← shown")
                } else {
                    ("  ", Color::White, "")
                };
                ListItem::new(Span::styled(
                    format!("{bullet}{}{suffix}", d.text),
                    Style::default().fg(color),
                ))
            })
            .collect()
    };

    let mut list_state = ListState::default();
    if !devices.is_empty() {
        list_state.select(Some(app.picker_cursor.min(devices.len() - 1)));
    }

    frame.render_stateful_widget(
        List::new(items)
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ "),
        list_area,
        &mut list_state,
    );

    frame.render_widget(
        Paragraph::new(Line::from(vec![
            key(" [↑↓]"),
            Span::raw(" Navigate  "),
            key("[↵]"),
            Span::raw(" Show  "),
            key("[d]"),
            Span::raw(" Disconnect  "),
            key("[Esc]"),
            Span::raw(" Close"),
        ])),
        hint_area,
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: audiovisor tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to audiovisor-tui.log so they never interfere with the display.
    // Set RUST_LOG=debug for verbose BLE diagnostics.
    {
        use std::fs::File;
        if let Ok(file) = File::create("audiovisor-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────
    let config = cli.session.config();
    let capacity = config.buffer_capacity;
    let transport = cli.session.transport(&config);
    let store = SettingsStore::new(&cli.session.settings).with_context(|| {
        format!("opening settings file {}", cli.session.settings.display())
    })?;
    let sessions = SessionManager::new(transport, config);
    let controls = store.control_settings();
    let control_tx = spawn_control_task(sessions.clone());
    // Records the starting values; nothing is connected yet.
    let _ = control_tx.send(ControlRequest::Update(controls, None));

    let app = Arc::new(Mutex::new(App::new(controls, cli.session.simulate)));
    for kind in &cli.pair {
        start_connect(*kind, &sessions, Arc::clone(&app), control_tx.clone());
    }

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    'main: loop {
        // ── 1. Copy what this frame needs out of the registry ─────────────────
        let (devices, live) = read_frame(&sessions, &app, &control_tx, capacity);

        // ── 2. Render ─────────────────────────────────────────────────────────
        {
            let mut s = lock(&app);
            s.update_rate(live.as_ref());
            let frozen = s.frozen.take();
            let view = frozen.as_ref().or(live.as_ref());
            terminal.draw(|f| draw(f, &s, view, &devices))?;
            s.frozen = frozen;
        }

        // ── 3. Handle keyboard ────────────────────────────────────────────────
        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        // In raw mode Ctrl+C arrives as a key event.
        let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL)
            && key.code == KeyCode::Char('c');
        if key.code == KeyCode::Char('q') || ctrl_c {
            break 'main;
        }

        // ── Device list keys ──────────────────────────────────────────────────
        if lock(&app).show_picker {
            match key.code {
                KeyCode::Esc => lock(&app).show_picker = false,
                KeyCode::Up => {
                    let mut s = lock(&app);
                    s.picker_cursor = s.picker_cursor.saturating_sub(1);
                }
                KeyCode::Down => {
                    let mut s = lock(&app);
                    let max = devices.len().saturating_sub(1);
                    if s.picker_cursor < max {
                        s.picker_cursor += 1;
                    }
                }
                KeyCode::Enter => {
                    let cursor = lock(&app).picker_cursor;
                    if let Some(d) = devices.get(cursor) {
                        select(&app, Some(d.id.clone()), &control_tx);
                        lock(&app).show_picker = false;
                    }
                }
                KeyCode::Char('d') => {
                    let cursor = lock(&app).picker_cursor;
                    if let Some(d) = devices.get(cursor) {
                        disconnect(&sessions, Some(d.id.clone()));
                    }
                }
                KeyCode::Char('1') => {
                    start_connect(DeviceKind::Lr, &sessions, Arc::clone(&app), control_tx.clone())
                }
                KeyCode::Char('2') => {
                    start_connect(DeviceKind::Ud, &sessions, Arc::clone(&app), control_tx.clone())
                }
                _ => {}
            }
            continue;
        }

        // ── Dashboard keys ────────────────────────────────────────────────────
        match key.code {
            KeyCode::Esc => break 'main,

            KeyCode::Char('1') => {
                start_connect(DeviceKind::Lr, &sessions, Arc::clone(&app), control_tx.clone())
            }
            KeyCode::Char('2') => {
                start_connect(DeviceKind::Ud, &sessions, Arc::clone(&app), control_tx.clone())
            }

            KeyCode::Tab => {
                let mut s = lock(&app);
                s.show_picker = true;
                if let Some(sel) = &s.selected {
                    if let Some(i) = devices.iter().position(|d| &d.id == sel) {
                        s.picker_cursor = i;
                    }
                }
            }
            KeyCode::Char('n') => {
                let current = lock(&app).selected.clone();
                let next = match current.and_then(|id| devices.iter().position(|d| d.id == id)) {
                    Some(i) => devices.get((i + 1) % devices.len().max(1)),
                    None => devices.first(),
                };
                if let Some(d) = next {
                    select(&app, Some(d.id.clone()), &control_tx);
                }
            }

            KeyCode::Char('d') => {
                let selected = lock(&app).selected.clone();
                if selected.is_some() {
                    disconnect(&sessions, selected);
                }
            }
            KeyCode::Char('D') => disconnect(&sessions, None),

            // Controls
            KeyCode::Char('[') => change_controls(&app, &store, &control_tx, |c| {
                c.with_sensitivity(i64::from(c.sensitivity) - SENSITIVITY_STEP)
            }),
            KeyCode::Char(']') => change_controls(&app, &store, &control_tx, |c| {
                c.with_sensitivity(i64::from(c.sensitivity) + SENSITIVITY_STEP)
            }),
            KeyCode::Char(',') => change_controls(&app, &store, &control_tx, |c| {
                c.with_brightness(i64::from(c.brightness) - BRIGHTNESS_STEP)
            }),
            KeyCode::Char('.') => change_controls(&app, &store, &control_tx, |c| {
                c.with_brightness(i64::from(c.brightness) + BRIGHTNESS_STEP)
            }),
            KeyCode::Char('r') => {
                if let Some(id) = lock(&app).selected.clone() {
                    let _ = control_tx.send(ControlRequest::Resend(id));
                }
            }

            // Y scale
            KeyCode::Char('+') | KeyCode::Char('=') => lock(&app).scale_up(),
            KeyCode::Char('-') => lock(&app).scale_down(),
            KeyCode::Char('a') => {
                let mut s = lock(&app);
                let frozen = s.frozen.take();
                s.auto_scale(frozen.as_ref().or(live.as_ref()));
                s.frozen = frozen;
            }

            KeyCode::Char('v') => {
                let mut s = lock(&app);
                s.smooth = !s.smooth;
            }

            KeyCode::Char('p') => {
                let mut s = lock(&app);
                s.frozen = match s.frozen.take() {
                    Some(_) => None,
                    None => live,
                };
            }

            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    sessions.disconnect(None).await;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A failed pairing while another device streams must not stall the
    /// frame loop: the pump writes the registry continuously while the
    /// connect task records its error and the loop reads both.
    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn failed_pairing_while_streaming_does_not_stall_frames() {
        let sim = Arc::new(SimTransport::new());
        sim.push(SimDevice::synthetic("stream", DeviceKind::Ud));
        let sessions = SessionManager::new(sim.clone(), SessionConfig::default());
        let streaming = sessions.connect(DeviceKind::Ud).await.unwrap();

        let app = Arc::new(Mutex::new(App::new(ControlSettings::default(), true)));
        let control_tx = spawn_control_task(sessions.clone());
        // Nothing else is queued, so this pairing fails.
        start_connect(DeviceKind::Lr, &sessions, Arc::clone(&app), control_tx.clone());

        let frames = {
            let sessions = sessions.clone();
            let app = Arc::clone(&app);
            tokio::task::spawn_blocking(move || loop {
                let (devices, live) = read_frame(&sessions, &app, &control_tx, 512);
                let s = lock(&app);
                if s.connecting.is_empty() && s.last_error.is_some() {
                    return (devices.len(), live.map(|v| v.id));
                }
            })
        };
        let (n_devices, shown) = tokio::time::timeout(Duration::from_secs(5), frames)
            .await
            .expect("frame loop stalled")
            .unwrap();

        assert_eq!(n_devices, 1);
        assert_eq!(shown, Some(streaming));
        assert!(lock(&app)
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no matching device")));
    }

    #[test]
    fn smoothing_keeps_length_and_flattens_spikes() {
        let data: Vec<(f64, f64)> = (0..9).map(|i| (i as f64, if i == 4 { 5.0 } else { 0.0 })).collect();
        let out = smooth_signal(&data, SMOOTH_WINDOW);
        assert_eq!(out.len(), data.len());
        assert!(out[4].1 < 5.0 && out[4].1 > 0.0);
        assert_eq!(out[0].1, 0.0);
    }
}
