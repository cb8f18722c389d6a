//! Engine façade
//!
//! [`Engine`] ties the driver, the receive pipeline, the signal database and
//! the trace model together behind one small API. It is single-threaded:
//! the host calls [`Engine::poll`] from its event loop and the engine runs
//! its timers from there.
//!
//! ## Timers
//! - flush, every 50 ms while measuring: pending frames become trace rows
//! - rate, every second while measuring: frames/s and the status line
//! - health, every 2 s after startup: channel re-enumeration or lost-port
//!   detection
//!
//! ## Driver slot
//! The driver lives in an [`ArcSwap`]. When hardware initialization does
//! not return within the watchdog timeout the stalled driver is moved to a
//! graveyard that is never touched again, and the simulator takes its
//! place. The init thread keeps its own `Arc` and dies with the process.

use crate::config::{BusConfig, ChannelConfig, Settings, ThemeSettings, WindowState, MAX_CHANNELS};
use crate::driver::{
    is_fatal_hardware_error, CanDriver, ChannelInfo, DriverEvent, SimulatedDriver, VectorDriver,
};
use crate::formats::{read_trace, write_trace};
use crate::logging::SessionLog;
use crate::pipeline::{RateCounter, ReceivePipeline};
use crate::signals::{parse_dbc_file, SignalDatabase};
use crate::trace::{DisplayMode, ModelChange, TraceEntry, TraceModel};
use crate::types::{CanFrame, EngineError, Result, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
pub const RATE_INTERVAL: Duration = Duration::from_secs(1);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(2);
pub const INIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared driver handle
pub type DriverHandle = Arc<Box<dyn CanDriver>>;

/// Change notifications published to engine subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ConnectedChanged(bool),
    MeasuringChanged(bool),
    PausedChanged(bool),
    DriverNameChanged(String),
    ChannelListChanged(Vec<String>),
    DbcInfoChanged(String),
    StatusText(String),
    InitStatus(String),
    InitComplete,
    FrameCountChanged(usize),
    FrameRateChanged(u64),
    DisplayModeChanged(DisplayMode),
    /// Short user-facing error message
    Error(String),
}

/// Hardware/measurement state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    OpenSilent,
    Measuring,
    MeasuringPaused,
}

/// Periodic timer driven by `poll`
#[derive(Debug, Clone, Copy)]
struct Ticker {
    period: Duration,
    due: Option<Instant>,
}

impl Ticker {
    fn new(period: Duration) -> Self {
        Self { period, due: None }
    }

    fn start(&mut self, now: Instant) {
        self.due = Some(now + self.period);
    }

    fn stop(&mut self) {
        self.due = None;
    }

    fn is_active(&self) -> bool {
        self.due.is_some()
    }

    fn fire(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = Some(now + self.period);
                true
            }
            _ => false,
        }
    }
}

type InitOutcome = (Result<()>, Vec<ChannelInfo>);

enum InitPhase {
    Idle,
    LoadingDbc {
        results: Receiver<Vec<(usize, String, SignalDatabase)>>,
        cancel: Arc<AtomicBool>,
    },
    Detecting {
        outcome: Receiver<InitOutcome>,
        cancel: Arc<AtomicBool>,
        deadline: Instant,
    },
}

/// The engine façade
pub struct Engine {
    driver: ArcSwap<Box<dyn CanDriver>>,
    driver_events: Receiver<DriverEvent>,
    /// Drivers abandoned by the init watchdog; never touched again
    graveyard: Vec<DriverHandle>,
    init_timeout: Duration,

    settings: Settings,
    settings_path: Option<PathBuf>,
    channel_dbs: Vec<SignalDatabase>,
    /// Path each cached channel database was parsed from
    channel_db_paths: Vec<String>,
    database: SignalDatabase,
    dbc_info: String,

    channel_infos: Vec<ChannelInfo>,
    channel_list: Vec<String>,

    pipeline: ReceivePipeline,
    rate: RateCounter,
    frame_rate: u64,
    model: TraceModel,

    connected: bool,
    measuring: bool,
    paused: bool,
    status: String,
    init_status: String,
    init_complete: bool,
    init: InitPhase,
    health_probe: Option<Receiver<Vec<ChannelInfo>>>,

    flush_timer: Ticker,
    rate_timer: Ticker,
    health_timer: Ticker,

    subscribers: Vec<Sender<EngineEvent>>,
    log_sink: Option<Arc<SessionLog>>,
}

impl Engine {
    /// Engine over the Vector driver when its library loads, the simulator
    /// otherwise
    pub fn new(settings: Settings) -> Self {
        let vector = VectorDriver::default();
        let driver: Box<dyn CanDriver> = if vector.is_available() {
            log::info!("Vector XL library found");
            Box::new(vector)
        } else {
            log::info!("Vector XL library not available, using Demo driver");
            Box::new(SimulatedDriver::new())
        };
        Self::with_driver(settings, driver)
    }

    /// Engine over a specific driver
    pub fn with_driver(mut settings: Settings, driver: Box<dyn CanDriver>) -> Self {
        settings.normalize_channels();
        let driver_events = driver.subscribe();
        let mut model = TraceModel::new();
        if settings.trace.in_place {
            model.set_display_mode(DisplayMode::InPlace);
        }
        Self {
            driver: ArcSwap::from_pointee(driver),
            driver_events,
            graveyard: Vec::new(),
            init_timeout: INIT_TIMEOUT,
            settings,
            settings_path: None,
            channel_dbs: vec![SignalDatabase::new(); MAX_CHANNELS],
            channel_db_paths: vec![String::new(); MAX_CHANNELS],
            database: SignalDatabase::new(),
            dbc_info: String::new(),
            channel_infos: Vec::new(),
            channel_list: Vec::new(),
            pipeline: ReceivePipeline::new(),
            rate: RateCounter::new(),
            frame_rate: 0,
            model,
            connected: false,
            measuring: false,
            paused: false,
            status: String::new(),
            init_status: String::new(),
            init_complete: false,
            init: InitPhase::Idle,
            health_probe: None,
            flush_timer: Ticker::new(FLUSH_INTERVAL),
            rate_timer: Ticker::new(RATE_INTERVAL),
            health_timer: Ticker::new(HEALTH_INTERVAL),
            subscribers: Vec::new(),
            log_sink: None,
        }
    }

    /// Load settings from `path` and persist every change back to it
    ///
    /// A malformed file is logged and replaced by defaults.
    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Settings::load(&path) {
            Ok(settings) => {
                let in_place = settings.trace.in_place;
                self.settings = settings;
                self.model.set_display_mode(if in_place {
                    DisplayMode::InPlace
                } else {
                    DisplayMode::Append
                });
            }
            Err(e) => log::warn!("Settings not loaded, using defaults: {}", e),
        }
        self.settings_path = Some(path);
        self
    }

    /// Attach the session log sink; the engine closes it on shutdown
    pub fn with_log_sink(mut self, sink: Arc<SessionLog>) -> Self {
        if sink.previous_session_crashed() {
            log::warn!("Previous session did not shut down cleanly");
        }
        self.log_sink = Some(sink);
        self
    }

    /// Override the hardware init watchdog
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn log_sink(&self) -> Option<&Arc<SessionLog>> {
        self.log_sink.as_ref()
    }

    /// Receive change notifications
    pub fn subscribe(&mut self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Receive trace model structure notifications
    pub fn subscribe_model(&mut self) -> Receiver<ModelChange> {
        self.model.subscribe()
    }

    fn emit(&mut self, event: EngineEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.status == text {
            return;
        }
        log::debug!("Status: {}", text);
        self.status = text.clone();
        self.emit(EngineEvent::StatusText(text));
    }

    fn set_init_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.init_status != text {
            self.init_status = text.clone();
            self.emit(EngineEvent::InitStatus(text.clone()));
        }
        self.set_status(text);
    }

    fn report_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.emit(EngineEvent::Error(message));
    }

    // ── Observables ────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn state(&self) -> EngineState {
        match (self.connected, self.measuring, self.paused) {
            (false, _, _) => EngineState::Closed,
            (true, false, _) => EngineState::OpenSilent,
            (true, true, false) => EngineState::Measuring,
            (true, true, true) => EngineState::MeasuringPaused,
        }
    }

    pub fn driver_name(&self) -> String {
        self.driver.load().driver_name()
    }

    /// Current driver; holding the handle keeps it alive across swaps
    pub fn driver(&self) -> DriverHandle {
        self.driver.load_full()
    }

    /// Display strings of the detected channels
    pub fn channel_list(&self) -> &[String] {
        &self.channel_list
    }

    pub fn channel_infos(&self) -> &[ChannelInfo] {
        &self.channel_infos
    }

    pub fn dbc_info(&self) -> &str {
        &self.dbc_info
    }

    pub fn is_dbc_loaded(&self) -> bool {
        !self.database.is_empty()
    }

    /// The merged signal database used for decoding
    pub fn database(&self) -> &SignalDatabase {
        &self.database
    }

    pub fn status_text(&self) -> &str {
        &self.status
    }

    pub fn init_status(&self) -> &str {
        &self.init_status
    }

    pub fn is_init_complete(&self) -> bool {
        self.init_complete
    }

    pub fn frame_count(&self) -> usize {
        self.model.frame_count()
    }

    /// Frames per second over the last closed second
    pub fn frame_rate(&self) -> u64 {
        self.frame_rate
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.model.display_mode()
    }

    pub fn model(&self) -> &TraceModel {
        &self.model
    }

    pub fn pipeline(&self) -> &ReceivePipeline {
        &self.pipeline
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn window_state(&self) -> WindowState {
        self.settings.window
    }

    pub fn set_window_state(&mut self, window: WindowState) {
        self.settings.window = window;
        self.save_settings();
    }

    pub fn is_day_theme(&self) -> bool {
        self.settings.theme.is_day
    }

    pub fn set_day_theme(&mut self, is_day: bool) {
        self.settings.theme = ThemeSettings { is_day };
        self.save_settings();
    }

    fn save_settings(&self) {
        if let Some(path) = &self.settings_path {
            if let Err(e) = self.settings.save(path) {
                log::warn!("Settings not saved: {}", e);
            }
        }
    }

    // ── Startup ────────────────────────────────────────────────────────────

    /// Begin the startup sequence: DBC parse, merge, driver probe
    ///
    /// Runs once; progress is made by `poll`.
    pub fn start_init_sequence(&mut self) {
        if self.init_complete {
            log::debug!("start_init_sequence: already complete, skipping");
            return;
        }
        if !matches!(self.init, InitPhase::Idle) {
            log::debug!("start_init_sequence: already in progress, skipping");
            return;
        }
        self.set_init_status("Loading DBC files...");

        let tasks: Vec<(usize, String)> = self
            .settings
            .channels
            .iter()
            .filter(|c| c.enabled && c.has_dbc())
            .map(|c| (c.slot, strip_file_url(&c.dbc_path)))
            .collect();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(1);
        let worker_cancel = Arc::clone(&cancel);

        let spawned = thread::Builder::new()
            .name("autolens-dbc-load".to_string())
            .spawn(move || {
                let mut results = Vec::new();
                for (slot, path) in tasks {
                    if worker_cancel.load(Ordering::Acquire) {
                        return;
                    }
                    match parse_dbc_file(Path::new(&path)) {
                        Ok(load) => {
                            for issue in &load.issues {
                                log::warn!("DBC {} {}", path, issue);
                            }
                            if !load.database.is_empty() {
                                results.push((slot, path, load.database));
                            }
                        }
                        Err(e) => log::warn!("DBC for CH{} not loaded: {}", slot + 1, e),
                    }
                }
                if !worker_cancel.load(Ordering::Acquire) {
                    let _ = tx.send(results);
                }
            });

        match spawned {
            Ok(_) => self.init = InitPhase::LoadingDbc { results: rx, cancel },
            Err(e) => {
                log::error!("Cannot spawn DBC loader: {}", e);
                self.rebuild_merged_dbc();
                self.set_init_status("Detecting CAN hardware...");
                self.refresh_channels();
            }
        }
    }

    /// Block until startup finishes or `timeout` passes, polling meanwhile
    pub fn wait_for_init(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.init_complete {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.poll(now);
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Initialize the driver and enumerate channels on a worker thread
    ///
    /// A watchdog started here swaps in the simulator if the driver does
    /// not answer within the init timeout.
    pub fn refresh_channels(&mut self) {
        if matches!(self.init, InitPhase::Detecting { .. }) {
            log::debug!("refresh_channels: init already in progress, skipping");
            return;
        }
        self.set_status("Initializing driver...");

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(1);
        let driver = self.driver.load_full();
        let worker_cancel = Arc::clone(&cancel);

        let spawned = thread::Builder::new()
            .name("autolens-driver-init".to_string())
            .spawn(move || {
                let result = driver.initialize();
                if worker_cancel.load(Ordering::Acquire) {
                    return;
                }
                let channels = if result.is_ok() {
                    driver.detect_channels()
                } else {
                    Vec::new()
                };
                if !worker_cancel.load(Ordering::Acquire) {
                    let _ = tx.send((result, channels));
                }
            });

        match spawned {
            Ok(_) => {
                self.init = InitPhase::Detecting {
                    outcome: rx,
                    cancel,
                    deadline: Instant::now() + self.init_timeout,
                }
            }
            Err(e) => {
                log::error!("Cannot spawn driver init thread: {}", e);
                let driver = self.driver.load_full();
                let result = driver.initialize();
                let channels = driver.detect_channels();
                self.apply_driver_init_result(result, channels);
            }
        }
    }

    fn advance_init(&mut self, now: Instant) {
        match std::mem::replace(&mut self.init, InitPhase::Idle) {
            InitPhase::Idle => {}
            InitPhase::LoadingDbc { results, cancel } => match results.try_recv() {
                Ok(loaded) => {
                    for (slot, path, db) in loaded {
                        self.channel_dbs[slot] = db;
                        self.channel_db_paths[slot] = path;
                    }
                    self.rebuild_merged_dbc();
                    self.set_init_status("Detecting CAN hardware...");
                    self.refresh_channels();
                }
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    self.init = InitPhase::LoadingDbc { results, cancel };
                }
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    log::warn!("DBC loader exited without a result");
                    self.rebuild_merged_dbc();
                    self.set_init_status("Detecting CAN hardware...");
                    self.refresh_channels();
                }
            },
            InitPhase::Detecting {
                outcome,
                cancel,
                deadline,
            } => match outcome.try_recv() {
                Ok((result, channels)) => self.apply_driver_init_result(result, channels),
                Err(crossbeam_channel::TryRecvError::Empty) if now < deadline => {
                    self.init = InitPhase::Detecting {
                        outcome,
                        cancel,
                        deadline,
                    };
                }
                Err(_) => {
                    cancel.store(true, Ordering::Release);
                    self.fall_back_to_simulator();
                }
            },
        }
    }

    fn fall_back_to_simulator(&mut self) {
        let timeout = EngineError::DriverInitTimeout(self.init_timeout.as_millis() as u64);
        log::warn!("{}: falling back to Demo driver", timeout);

        let simulator: Box<dyn CanDriver> = Box::new(SimulatedDriver::new());
        self.driver_events = simulator.subscribe();
        let stalled = self.driver.swap(Arc::new(simulator));
        self.graveyard.push(stalled);

        let driver = self.driver.load_full();
        let result = driver.initialize();
        let channels = driver.detect_channels();
        self.apply_driver_init_result(result, channels);

        self.set_init_status(format!(
            "Vector HW unavailable (timeout) — using Demo driver | {} channel(s)",
            self.channel_list.len()
        ));
        let name = self.driver_name();
        self.emit(EngineEvent::DriverNameChanged(name));
    }

    fn apply_driver_init_result(&mut self, result: Result<()>, channels: Vec<ChannelInfo>) {
        match result {
            Ok(()) => {
                self.set_channels(channels);
                let name = self.driver_name();
                self.emit(EngineEvent::DriverNameChanged(name.clone()));
                if self.channel_list.is_empty() {
                    self.set_init_status("No CAN channels found — connect hardware or use Demo");
                } else {
                    self.set_init_status(format!(
                        "{} | {} channel(s) available",
                        name,
                        self.channel_list.len()
                    ));
                }
            }
            Err(e) => {
                let reason = match self.driver.load().last_error() {
                    msg if msg.is_empty() => e.to_string(),
                    msg => msg,
                };
                self.set_init_status(format!("Driver init failed: {}", reason));
            }
        }

        if !self.init_complete {
            self.init_complete = true;
            self.health_timer.start(Instant::now());
            log::debug!("Startup complete, port health monitor active");
            self.emit(EngineEvent::InitComplete);
        }
    }

    fn set_channels(&mut self, channels: Vec<ChannelInfo>) {
        self.channel_list = channels.iter().map(ChannelInfo::display_string).collect();
        self.channel_infos = channels;
        let list = self.channel_list.clone();
        self.emit(EngineEvent::ChannelListChanged(list));
    }

    // ── Dispatcher ─────────────────────────────────────────────────────────

    /// Run everything that is due at `now`
    ///
    /// Services the driver, moves driver events into the pipeline, advances
    /// startup and fires the flush, rate and health timers.
    pub fn poll(&mut self, now: Instant) {
        self.driver.load().service(now);
        self.drain_driver_events();
        self.advance_init(now);

        if self.flush_timer.fire(now) {
            self.flush_pending();
        }
        if self.rate_timer.fire(now) {
            self.update_frame_rate();
        }
        self.collect_health_probe();
        if self.health_timer.fire(now) {
            self.check_port_health();
        }
    }

    fn drain_driver_events(&mut self) {
        let events: Vec<DriverEvent> = self.driver_events.try_iter().collect();
        let mut frames = Vec::new();
        for event in events {
            match event {
                DriverEvent::FrameReceived(frame) => frames.push(frame),
                DriverEvent::Error(message) => {
                    if !frames.is_empty() {
                        self.enqueue(std::mem::take(&mut frames));
                    }
                    self.on_driver_error(message);
                }
                DriverEvent::ChannelOpened => log::debug!("Driver channel opened"),
                DriverEvent::ChannelClosed => log::debug!("Driver channel closed"),
            }
        }
        if !frames.is_empty() {
            self.enqueue(frames);
        }
    }

    fn enqueue(&mut self, frames: Vec<CanFrame>) {
        let queued = self.pipeline.push_batch(frames);
        self.rate.record(queued);
    }

    fn on_driver_error(&mut self, message: String) {
        let simulated = self.driver.load().is_simulated();
        if self.connected && !simulated && is_fatal_hardware_error(&message) {
            log::warn!("Fatal hardware error, disconnecting: {}", message);
            self.disconnect_channels();
            self.set_status("CAN hardware removed — port closed");
        }
        self.report_error(message);
    }

    /// Commit pending frames to the model in one batch
    fn flush_pending(&mut self) {
        let batch = self.pipeline.take_pending();
        if batch.is_empty() {
            return;
        }
        log::trace!(
            "Flush: batch={} mode={:?} frames_before={}",
            batch.len(),
            self.model.display_mode(),
            self.model.frame_count()
        );
        let entries: Vec<TraceEntry> = batch
            .into_iter()
            .map(|frame| TraceEntry::new(frame, &self.database))
            .collect();
        self.model.add_entries(entries);
        let count = self.model.frame_count();
        self.emit(EngineEvent::FrameCountChanged(count));
    }

    fn update_frame_rate(&mut self) {
        self.frame_rate = self.rate.tick();
        self.emit(EngineEvent::FrameRateChanged(self.frame_rate));
        self.set_status(format!(
            "Measuring: {} fps  |  {} frames total",
            self.frame_rate,
            self.model.frame_count()
        ));
    }

    fn check_port_health(&mut self) {
        if self.health_probe.is_some() {
            return;
        }
        let driver = self.driver.load_full();

        if !self.connected {
            if driver.is_simulated() || !matches!(self.init, InitPhase::Idle) {
                return;
            }
            let (tx, rx) = bounded(1);
            let spawned = thread::Builder::new()
                .name("autolens-port-refresh".to_string())
                .spawn(move || {
                    let _ = tx.send(driver.detect_channels());
                });
            match spawned {
                Ok(_) => self.health_probe = Some(rx),
                Err(e) => log::warn!("Cannot spawn port refresh: {}", e),
            }
            return;
        }

        if !driver.is_open() {
            log::warn!("Health check: port closed unexpectedly, cleaning up");
            self.set_status("CAN hardware port lost — disconnected");
            self.report_error("CAN hardware was disconnected while in use");
            self.close_measurement();
            self.connected = false;
            self.emit(EngineEvent::ConnectedChanged(false));
        }
    }

    fn collect_health_probe(&mut self) {
        let Some(rx) = self.health_probe.take() else {
            return;
        };
        let channels = match rx.try_recv() {
            Ok(channels) => channels,
            Err(crossbeam_channel::TryRecvError::Empty) => {
                self.health_probe = Some(rx);
                return;
            }
            Err(crossbeam_channel::TryRecvError::Disconnected) => return,
        };

        let changed = channels.len() != self.channel_infos.len()
            || channels
                .iter()
                .zip(&self.channel_infos)
                .any(|(a, b)| a.name != b.name || a.serial != b.serial);
        if !changed {
            return;
        }
        self.set_channels(channels);
        if self.channel_list.is_empty() {
            self.set_status("No CAN hardware found — connect a device");
        } else {
            let status = format!(
                "{} | {} channel(s) available",
                self.driver_name(),
                self.channel_list.len()
            );
            self.set_status(status);
        }
        log::debug!("Port list updated by health check: {} channel(s)", self.channel_list.len());
    }

    // ── Connection and measurement ─────────────────────────────────────────

    /// Open the adapter channel of the first enabled slot in listen-only mode
    ///
    /// No-op when already connected.
    pub fn connect_channels(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let driver = self.driver.load_full();

        if let Err(e) = driver.initialize() {
            let reason = match driver.last_error() {
                msg if msg.is_empty() => e.to_string(),
                msg => msg,
            };
            self.set_status(format!("Driver init failed: {}", reason));
            return Err(e);
        }

        let mut bus = BusConfig::new().with_listen_only(true);
        let mut hw_index = 0usize;
        match self.settings.channels.iter().find(|c| c.enabled) {
            Some(cfg) => {
                bus = cfg.bus_config(true);
                if cfg.hw_channel_index >= 0 {
                    hw_index = cfg.hw_channel_index as usize;
                }
            }
            None => {
                let name = driver.driver_name();
                self.set_status(format!("Using defaults: {} | 500 kbit/s | listen-only", name));
            }
        }

        if self.channel_infos.is_empty() && driver.is_simulated() {
            self.set_channels(driver.detect_channels());
        }
        if self.channel_infos.is_empty() {
            self.report_error("No CAN channels available — try Refresh in CAN Config");
            self.set_status("No channels available");
            return Err(EngineError::NoChannels);
        }

        let hw_index = hw_index.min(self.channel_infos.len() - 1);
        let info = self.channel_infos[hw_index].clone();

        self.rebuild_merged_dbc();
        if driver.is_simulated() {
            driver.set_simulation_database(&self.database);
        }

        if let Err(e) = driver.open_channel(&info, &bus) {
            let message = match &e {
                EngineError::ChannelOpenFailed(reason) => reason.clone(),
                other => other.to_string(),
            };
            self.set_status(format!("Connect failed: {}", message));
            self.report_error(message);
            return Err(e);
        }

        self.connected = true;
        self.emit(EngineEvent::ConnectedChanged(true));

        let bitrate = if bus.fd_enabled {
            format!("{}k / {}k FD", bus.bitrate / 1000, bus.data_bitrate / 1000)
        } else {
            format!("{}k", bus.bitrate / 1000)
        };
        self.set_status(format!(
            "Connected: {} | {} | listen-only | press Start to measure",
            info.name, bitrate
        ));
        Ok(())
    }

    /// Stop measuring and release the channel; no-op when closed
    pub fn disconnect_channels(&mut self) {
        if !self.connected {
            return;
        }
        if self.measuring {
            self.stop();
        }
        self.driver.load().close_channel();

        self.connected = false;
        self.paused = false;
        self.pipeline.set_paused(false);
        self.emit(EngineEvent::ConnectedChanged(false));
        self.emit(EngineEvent::PausedChanged(false));
        self.set_status("Disconnected");
    }

    /// Start measuring, connecting first if needed; no-op while measuring
    pub fn start(&mut self) -> Result<()> {
        if self.measuring {
            return Ok(());
        }
        if !self.connected {
            self.connect_channels()?;
        }

        // frames that arrived before Start are discarded
        self.drain_driver_events();
        self.pipeline.clear();
        self.pipeline.set_paused(false);
        self.pipeline.set_measuring(true);
        self.rate.reset();

        self.measuring = true;
        self.paused = false;
        let now = Instant::now();
        self.flush_timer.start(now);
        self.rate_timer.start(now);

        self.emit(EngineEvent::MeasuringChanged(true));
        self.emit(EngineEvent::PausedChanged(false));
        self.set_status("Measuring — capturing CAN frames...");
        Ok(())
    }

    /// Stop measuring and keep the channel open; no-op when not measuring
    pub fn stop(&mut self) {
        if !self.measuring {
            return;
        }
        self.close_measurement();
        self.emit(EngineEvent::FrameRateChanged(self.frame_rate));
        let count = self.model.frame_count();
        self.set_status(format!("Stopped — {} frames captured", count));
    }

    /// Start when stopped, stop when measuring
    pub fn toggle_measurement(&mut self) -> Result<()> {
        if self.measuring {
            self.stop();
            Ok(())
        } else {
            self.start()
        }
    }

    fn close_measurement(&mut self) {
        if !self.measuring {
            return;
        }
        self.flush_timer.stop();
        self.rate_timer.stop();
        self.pipeline.set_measuring(false);
        self.pipeline.set_paused(false);
        self.pipeline.clear();
        self.measuring = false;
        self.paused = false;
        self.emit(EngineEvent::MeasuringChanged(false));
        self.emit(EngineEvent::PausedChanged(false));
    }

    /// Pause or resume; frames keep queuing while paused
    pub fn toggle_pause(&mut self) {
        if !self.measuring {
            return;
        }
        self.paused = !self.paused;
        self.pipeline.set_paused(self.paused);
        self.emit(EngineEvent::PausedChanged(self.paused));

        if self.paused {
            self.set_status("Measurement paused — frames queuing");
        } else {
            self.drain_driver_events();
            self.flush_pending();
            self.set_status("Measurement resumed");
        }
    }

    // ── Trace view ─────────────────────────────────────────────────────────

    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        if self.model.display_mode() == mode {
            return;
        }
        let before = self.model.frame_count();
        self.model.set_display_mode(mode);
        if self.model.frame_count() != before {
            let count = self.model.frame_count();
            self.emit(EngineEvent::FrameCountChanged(count));
        }
        self.emit(EngineEvent::DisplayModeChanged(mode));
        self.settings.trace.in_place = mode == DisplayMode::InPlace;
        self.save_settings();

        self.set_status(match mode {
            DisplayMode::InPlace => "Display mode: In-Place (latest value per frame)",
            DisplayMode::Append => "Display mode: Append (every frame as new row)",
        });
    }

    pub fn toggle_display_mode(&mut self) {
        let next = match self.model.display_mode() {
            DisplayMode::Append => DisplayMode::InPlace,
            DisplayMode::InPlace => DisplayMode::Append,
        };
        self.set_display_mode(next);
    }

    pub fn clear_trace(&mut self) {
        self.model.clear();
        self.emit(EngineEvent::FrameCountChanged(0));
        self.set_status("Trace cleared");
    }

    // ── Channel configuration and DBC ──────────────────────────────────────

    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.settings.channels.clone()
    }

    /// Replace the slot configurations, rebuild the merged DBC and persist
    pub fn apply_channel_configs(&mut self, configs: Vec<ChannelConfig>) {
        for (slot, mut cfg) in configs.into_iter().take(MAX_CHANNELS).enumerate() {
            cfg.slot = slot;
            if strip_file_url(&cfg.dbc_path) != self.channel_db_paths[slot] {
                self.channel_dbs[slot] = SignalDatabase::new();
                self.channel_db_paths[slot].clear();
            }
            self.settings.channels[slot] = cfg;
        }

        self.rebuild_merged_dbc();
        let driver = self.driver.load_full();
        if self.connected && driver.is_simulated() {
            driver.set_simulation_database(&self.database);
        }
        self.save_settings();
        self.set_status("Channel configuration saved");
        log::debug!("Channel configs applied, DBC: {}", self.dbc_info);
    }

    /// Parse a DBC for one slot and return its summary line
    ///
    /// The summary reads `"<file>  |  N msg  |  M sig"`. An out-of-range
    /// slot yields an empty summary.
    pub fn preload_channel_dbc(&mut self, slot: usize, path: &str) -> Result<String> {
        if slot >= MAX_CHANNELS {
            log::warn!("preload_channel_dbc: no slot {}", slot);
            return Ok(String::new());
        }
        let path = strip_file_url(path);
        if !Path::new(&path).exists() {
            self.report_error(format!("DBC file not found: {}", path));
            return Err(EngineError::FileNotFound(path));
        }

        let load = parse_dbc_file(Path::new(&path))?;
        for issue in &load.issues {
            log::warn!("DBC CH{} {}", slot + 1, issue);
        }
        let info = dbc_summary(&path, &load.database);
        self.channel_dbs[slot] = load.database;
        self.channel_db_paths[slot] = path.clone();

        let cfg = &mut self.settings.channels[slot];
        cfg.dbc_path = path;
        cfg.dbc_info = info.clone();
        log::debug!("CH{} DBC preloaded: {}", slot + 1, info);
        Ok(info)
    }

    /// Concatenate enabled slots' databases into the decoding database
    fn rebuild_merged_dbc(&mut self) {
        let mut merged = SignalDatabase::new();
        let mut parts = Vec::new();
        let (mut messages, mut signals) = (0usize, 0usize);

        for slot in 0..MAX_CHANNELS {
            let cfg = &self.settings.channels[slot];
            if !cfg.enabled || !cfg.has_dbc() {
                continue;
            }
            let path = strip_file_url(&cfg.dbc_path);
            if self.channel_dbs[slot].is_empty() || self.channel_db_paths[slot] != path {
                match parse_dbc_file(Path::new(&path)) {
                    Ok(load) => {
                        self.channel_dbs[slot] = load.database;
                        self.channel_db_paths[slot] = path.clone();
                    }
                    Err(e) => log::warn!("DBC for CH{} not loaded: {}", slot + 1, e),
                }
            }
            let db = &self.channel_dbs[slot];
            if db.is_empty() {
                continue;
            }
            merged.merge(db);
            messages += db.message_count();
            signals += db.total_signal_count();
            parts.push(format!("CH{}: {}", slot + 1, file_name(&path)));
        }

        merged.build_index();
        self.database = merged;
        let info = if self.database.is_empty() {
            String::new()
        } else {
            format!("{}  [{} msg, {} sig total]", parts.join(" | "), messages, signals)
        };
        if info != self.dbc_info {
            self.dbc_info = info.clone();
            if !info.is_empty() {
                log::debug!("Merged DBC: {}", info);
            }
            self.emit(EngineEvent::DbcInfoChanged(info));
        }
    }

    /// Load one DBC as the whole decoding database
    ///
    /// Replaced again by the per-channel merge on the next connect or
    /// configuration change.
    pub fn load_dbc(&mut self, path: &str) -> Result<String> {
        let path = strip_file_url(path);
        if !Path::new(&path).exists() {
            self.set_status(format!("DBC file not found: {}", path));
            self.report_error(format!("File not found: {}", path));
            return Err(EngineError::FileNotFound(path));
        }

        let load = parse_dbc_file(Path::new(&path))?;
        for issue in &load.issues {
            log::warn!("DBC {}", issue);
        }
        self.database = load.database;
        let driver = self.driver.load_full();
        if driver.is_simulated() {
            driver.set_simulation_database(&self.database);
        }

        self.dbc_info = dbc_summary(&path, &self.database);
        let info = self.dbc_info.clone();
        self.emit(EngineEvent::DbcInfoChanged(info.clone()));
        self.set_status(format!("DBC loaded: {}", info));
        Ok(info)
    }

    // ── Files and transmit ─────────────────────────────────────────────────

    /// Load an ASC/BLF file into the trace, replacing or appending
    ///
    /// Nothing in the model changes unless the whole file parses.
    pub fn import_trace(&mut self, path: &str, append: bool) -> Result<usize> {
        let path = PathBuf::from(strip_file_url(path));
        if !path.exists() {
            let message = format!("Trace file not found: {}", path.display());
            self.set_status(message.clone());
            self.report_error(message);
            return Err(EngineError::FileNotFound(path.display().to_string()));
        }

        let frames = match read_trace(&path) {
            Ok(frames) => frames,
            Err(e) => {
                self.set_status(format!("Import failed: {}", e));
                self.report_error(e.to_string());
                return Err(e);
            }
        };

        if self.measuring {
            self.stop();
        }
        self.pipeline.clear();
        self.rate.reset();
        if self.frame_rate != 0 {
            self.frame_rate = 0;
            self.emit(EngineEvent::FrameRateChanged(0));
        }

        let entries: Vec<TraceEntry> = frames
            .into_iter()
            .map(|frame| TraceEntry::new(frame, &self.database))
            .collect();
        let imported = entries.len();
        if append {
            self.model.add_entries(entries);
        } else {
            self.model.replace_all(entries);
        }
        let count = self.model.frame_count();
        self.emit(EngineEvent::FrameCountChanged(count));

        self.set_status(format!(
            "Offline trace {}: {} ({} frames)",
            if append { "appended" } else { "loaded" },
            file_name(&path.to_string_lossy()),
            imported
        ));
        Ok(imported)
    }

    /// Export the trace; the extension picks ASC, BLF or CSV
    pub fn save_trace(&mut self, path: &str) -> Result<usize> {
        let path = PathBuf::from(strip_file_url(path));
        match write_trace(&path, self.model.entries()) {
            Ok(_) => {
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_uppercase())
                    .unwrap_or_default();
                let count = self.model.frame_count();
                self.set_status(format!(
                    "Trace saved: {}  ({} frames)  [{}]",
                    file_name(&path.to_string_lossy()),
                    count,
                    ext
                ));
                Ok(count)
            }
            Err(e) => {
                self.set_status(format!("Save failed: {}", e));
                self.report_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Transmit one classic frame built from space-separated hex bytes
    ///
    /// At most eight bytes are sent; unparsable tokens send as zero.
    pub fn send_frame(&mut self, id: u32, hex_data: &str, extended: bool) -> Result<()> {
        if !self.connected {
            self.report_error("Not connected — cannot send");
            return Err(EngineError::NotConnected);
        }
        let bytes: Vec<u8> = hex_data
            .split_whitespace()
            .take(8)
            .map(|token| u8::from_str_radix(token, 16).unwrap_or(0))
            .collect();
        let id = id & MAX_EXTENDED_ID;
        let mut frame = CanFrame::classic(id, &bytes);
        frame.is_extended = extended || id > MAX_STANDARD_ID;

        if let Err(e) = self.driver.load().transmit(&frame) {
            let reason = match &e {
                EngineError::TransmitFailed(reason) => reason.clone(),
                other => other.to_string(),
            };
            self.report_error(format!("TX failed: {}", reason));
            return Err(e);
        }
        Ok(())
    }

    /// Orderly shutdown: stop, disconnect, release the driver, close the log
    ///
    /// Drivers abandoned by the init watchdog are left alone.
    pub fn shutdown(&mut self) {
        match std::mem::replace(&mut self.init, InitPhase::Idle) {
            InitPhase::LoadingDbc { cancel, .. } | InitPhase::Detecting { cancel, .. } => {
                cancel.store(true, Ordering::Release);
            }
            InitPhase::Idle => {}
        }
        self.disconnect_channels();
        self.health_timer.stop();
        self.driver.load().shutdown();
        self.save_settings();
        log::info!("Engine shut down ({} frames in trace)", self.model.frame_count());
        if let Some(sink) = &self.log_sink {
            log::logger().flush();
            sink.finish();
        }
    }

    /// Drivers abandoned by the init watchdog
    pub fn abandoned_driver_count(&self) -> usize {
        self.graveyard.len()
    }

    /// True while the flush timer runs
    pub fn is_flush_active(&self) -> bool {
        self.flush_timer.is_active()
    }
}

/// `"<file>  |  N msg  |  M sig"`
pub fn dbc_summary(path: &str, db: &SignalDatabase) -> String {
    format!(
        "{}  |  {} msg  |  {} sig",
        file_name(path),
        db.message_count(),
        db.total_signal_count()
    )
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Strip a `file://` URL prefix; `file:///C:/x` becomes `C:/x`
pub fn strip_file_url(path: &str) -> String {
    let Some(rest) = path.strip_prefix("file://") else {
        return path.to_string();
    };
    let bytes = rest.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        rest[1..].to_string()
    } else {
        rest.to_string()
    }
}
