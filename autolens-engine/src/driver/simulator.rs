//! Simulated CAN driver
//!
//! Produces synthetic traffic on a 10 ms tick so the rest of the system can
//! be exercised without hardware. Traffic is generated by a
//! [`SimulationProfile`]: either a plan derived from a signal database, so
//! decoded values are meaningful, or a fixed set of built-in powertrain,
//! chassis and body messages.
//!
//! The driver has no thread of its own. The engine calls
//! [`CanDriver::service`] on every poll and the driver catches up on the
//! ticks that elapsed since the channel was opened.

use crate::config::BusConfig;
use crate::driver::{CanDriver, ChannelInfo, DriverEvent, EventHub};
use crate::signals::codec;
use crate::signals::{MessageDefinition, MuxIndicator, SignalDatabase, SignalDefinition};
use crate::types::{CanFrame, EngineError, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Simulation tick
pub const TICK: Duration = Duration::from_millis(10);

/// Ticks processed by one `service` call at most
pub const MAX_CATCH_UP_TICKS: u64 = 100;

/// Messages taken from a database
const MAX_PLANS: usize = 8;

/// Period of the i-th plan in ticks (10 ms .. 2 s)
const PLAN_PERIODS: [u64; 8] = [1, 2, 5, 10, 20, 50, 100, 200];

#[derive(Debug, Clone)]
struct SimulationPlan {
    message: MessageDefinition,
    period_ticks: u64,
}

/// Traffic generator
///
/// Pure function of the tick number: the same tick always yields the same
/// frames.
#[derive(Debug, Clone, Default)]
pub struct SimulationProfile {
    plans: Vec<SimulationPlan>,
}

impl SimulationProfile {
    /// Built-in traffic only
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Derive a plan from a database
    ///
    /// Classic messages (DLC 1..8) with at least one signal are sorted by
    /// id then name, and the first eight get periods spread from 10 ms to
    /// 2 s. An empty or unusable database yields the built-in profile.
    pub fn from_database(db: &SignalDatabase) -> Self {
        let mut candidates: Vec<&MessageDefinition> = db
            .messages()
            .iter()
            .filter(|m| (1..=8).contains(&m.dlc) && !m.signals.is_empty())
            .collect();

        if candidates.is_empty() {
            if !db.is_empty() {
                log::debug!("Database has no usable classic messages, using built-in simulation");
            }
            return Self::builtin();
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));

        let plans: Vec<SimulationPlan> = candidates
            .into_iter()
            .take(MAX_PLANS)
            .enumerate()
            .map(|(i, message)| SimulationPlan {
                message: message.clone(),
                period_ticks: PLAN_PERIODS[i % PLAN_PERIODS.len()],
            })
            .collect();

        let summary: Vec<String> = plans
            .iter()
            .map(|p| {
                let width = if p.message.is_extended { 8 } else { 3 };
                format!(
                    "0x{:0width$X}({}/{}ms)",
                    p.message.id,
                    p.message.name,
                    p.period_ticks * TICK.as_millis() as u64,
                    width = width
                )
            })
            .collect();
        log::info!("Simulation profile active: {}", summary.join(", "));

        Self { plans }
    }

    /// True if traffic is database-driven
    pub fn is_database_driven(&self) -> bool {
        !self.plans.is_empty()
    }

    /// Ids and periods of the database plans
    pub fn schedule(&self) -> Vec<(u32, Duration)> {
        self.plans
            .iter()
            .map(|p| (p.message.id, TICK * p.period_ticks as u32))
            .collect()
    }

    /// Frames due at `tick`, stamped on channel 1
    pub fn frames_for_tick(&self, tick: u64) -> Vec<CanFrame> {
        let timestamp_ns = tick * TICK.as_nanos() as u64;
        let seconds = timestamp_ns as f64 / 1e9;
        let frames = if self.plans.is_empty() {
            builtin_frames(tick, seconds)
        } else {
            self.plans
                .iter()
                .enumerate()
                .filter(|(_, plan)| tick % plan.period_ticks == 0)
                .map(|(index, plan)| plan_frame(plan, index as u64, tick, seconds))
                .collect()
        };
        frames
            .into_iter()
            .map(|f| f.on_channel(1).at(timestamp_ns))
            .collect()
    }
}

fn clamp_to_range(value: f64, signal: &SignalDefinition) -> f64 {
    if signal.has_range() {
        value.clamp(signal.min, signal.max)
    } else {
        value
    }
}

fn plan_frame(plan: &SimulationPlan, plan_index: u64, tick: u64, seconds: f64) -> CanFrame {
    let message = &plan.message;
    let step = tick / plan.period_ticks.max(1);
    let mut values: HashMap<&str, f64> = HashMap::new();

    let selector = message.selector();
    let mut mux_values: Vec<u64> = Vec::new();
    for signal in &message.signals {
        if let MuxIndicator::Multiplexed(v) = signal.mux {
            if !mux_values.contains(&v) {
                mux_values.push(v);
            }
        }
    }

    let active_mux = selector.map(|selector| {
        let active = if mux_values.is_empty() {
            0
        } else {
            mux_values[((step + plan_index) % mux_values.len() as u64) as usize]
        };
        let physical = codec::raw_bits_to_physical(selector, active);
        values.insert(selector.name.as_str(), clamp_to_range(physical, selector));
        active
    });

    for (i, signal) in message.signals.iter().enumerate() {
        let signal_index = i as u64 + 1;
        match (signal.mux, active_mux) {
            (MuxIndicator::Selector, _) => continue,
            (MuxIndicator::Multiplexed(v), Some(active)) if v != active => continue,
            _ => {}
        }

        let value = if !signal.value_descriptions.is_empty() {
            let keys: Vec<i64> = signal.value_descriptions.keys().copied().collect();
            let idx = ((step + plan_index + signal_index) % keys.len() as u64) as usize;
            raw_to_physical(signal, keys[idx])
        } else if signal.length == 1 && !signal.value_type.is_float() {
            let toggle = (tick / (5 + plan_index + signal_index)) % 2;
            raw_to_physical(signal, toggle as i64)
        } else if signal.has_range() {
            let center = (signal.min + signal.max) * 0.5;
            let amplitude = (signal.max - signal.min) * 0.35;
            let freq = 0.12 + plan_index as f64 * 0.03 + signal_index as f64 * 0.015;
            center + amplitude * (seconds * freq + plan_index as f64).sin()
        } else if signal.initial_value.abs() > 1e-9 {
            signal.initial_value
        } else {
            signal.offset
        };

        values.insert(signal.name.as_str(), clamp_to_range(value, signal));
    }

    let len = message.dlc.min(8) as usize;
    let mut data = [0u8; 8];
    for signal in &message.signals {
        if let Some(value) = values.get(signal.name.as_str()) {
            codec::encode(signal, &mut data[..len], *value);
        }
    }

    let mut frame = CanFrame::classic(message.id, &data[..len]);
    frame.is_extended = message.is_extended;
    frame
}

fn raw_to_physical(signal: &SignalDefinition, raw: i64) -> f64 {
    raw as f64 * signal.factor + signal.offset
}

fn builtin_frames(tick: u64, s: f64) -> Vec<CanFrame> {
    let mut frames = Vec::with_capacity(5);

    // 0x0C4 engine, every tick
    let rpm = 800.0 + 1200.0 * (0.5 + 0.5 * (s * 0.5).sin());
    let throttle = 10.0 + 40.0 * (0.5 + 0.5 * (s * 0.3).sin());
    let coolant = 85.0 + 5.0 * (s * 0.1).sin();
    let raw_rpm = ((rpm / 0.25) as u16).to_le_bytes();
    frames.push(CanFrame::classic(
        0x0C4,
        &[
            raw_rpm[0],
            raw_rpm[1],
            (throttle / 0.5) as u8,
            (coolant + 40.0) as u8,
            0,
            0,
            0,
            0,
        ],
    ));

    // 0x153 chassis, 20 ms
    if tick % 2 == 0 {
        let speed = 60.0 + 30.0 * (s * 0.2).sin();
        let brake = if speed < 50.0 { 20.0 } else { 5.0 };
        let steering = 15.0 * (s * 0.7).sin();
        let raw_speed = ((speed / 0.01) as u16).to_le_bytes();
        let raw_steer = ((steering / 0.1) as i16).to_le_bytes();
        frames.push(CanFrame::classic(
            0x153,
            &[
                raw_speed[0],
                raw_speed[1],
                brake as u8,
                raw_steer[0],
                raw_steer[1],
                0,
                0,
                0,
            ],
        ));
    }

    // 0x1A0 body, 100 ms
    if tick % 10 == 0 {
        let fuel = 65.0 - tick as f64 / 10000.0;
        let odo = (tick / 10) as f64 * 0.002778;
        let ambient = 22.0 + 3.0 * (s * 0.05).sin();
        frames.push(CanFrame::classic(
            0x1A0,
            &[
                (fuel.clamp(0.0, 100.0) / 0.4) as u8,
                ((odo as i64) & 0xFF) as u8,
                ((ambient + 40.0) / 0.5) as u8,
                0,
                0,
                0,
                0,
                0,
            ],
        ));
    }

    // 0x6B2 gateway, 500 ms
    if tick % 50 == 0 {
        let voltage = 13.8 + 0.2 * (s * 2.0).sin();
        let raw_volt = ((voltage / 0.1) as u16).to_le_bytes();
        frames.push(CanFrame::classic(
            0x6B2,
            &[0x02, raw_volt[0], raw_volt[1], 0, 0, 0, 0, 0],
        ));
    }

    // 0x7DF OBD keep-alive, 5 s
    if tick % 500 == 0 {
        frames.push(CanFrame::classic(0x7DF, &[0x02, 0x01, 0, 0, 0, 0, 0, 0]));
    }

    frames
}

#[derive(Debug, Default)]
struct RunState {
    open: bool,
    tick: u64,
    started: Option<Instant>,
}

/// Driver producing synthetic traffic
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    hub: EventHub,
    profile: Mutex<SimulationProfile>,
    run: Mutex<RunState>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks generated since the channel was opened
    pub fn tick(&self) -> u64 {
        self.run.lock().tick
    }

    fn elapsed_ns(&self) -> u64 {
        self.run
            .lock()
            .started
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0)
    }
}

impl CanDriver for SimulatedDriver {
    fn driver_name(&self) -> String {
        "Demo".to_string()
    }

    fn is_available(&self) -> bool {
        true
    }

    fn initialize(&self) -> Result<()> {
        log::debug!("[DemoDriver] Initialized (no hardware required)");
        Ok(())
    }

    fn shutdown(&self) {
        self.close_channel();
    }

    fn detect_channels(&self) -> Vec<ChannelInfo> {
        vec![ChannelInfo {
            name: "Demo Channel 1".to_string(),
            hw_type_name: "Simulated".to_string(),
            channel_mask: 1,
            supports_fd: false,
            ..Default::default()
        }]
    }

    fn open_channel(&self, _info: &ChannelInfo, _config: &BusConfig) -> Result<()> {
        {
            let mut run = self.run.lock();
            if run.open {
                return Err(EngineError::ChannelOpenFailed("Already open".to_string()));
            }
            *run = RunState {
                open: true,
                tick: 0,
                started: Some(Instant::now()),
            };
        }
        log::info!("[DemoDriver] Channel opened, synthetic traffic started");
        self.hub.publish(DriverEvent::ChannelOpened);
        Ok(())
    }

    fn close_channel(&self) {
        {
            let mut run = self.run.lock();
            if !run.open {
                return;
            }
            run.open = false;
        }
        log::info!("[DemoDriver] Channel closed");
        self.hub.publish(DriverEvent::ChannelClosed);
    }

    fn is_open(&self) -> bool {
        self.run.lock().open
    }

    fn transmit(&self, frame: &CanFrame) -> Result<()> {
        log::debug!("[DemoDriver] TX 0x{:X}", frame.id);
        let mut echo = *frame;
        echo.is_tx_echo = true;
        echo.timestamp_ns = self.elapsed_ns();
        self.hub.publish(DriverEvent::FrameReceived(echo));
        Ok(())
    }

    fn receive(&self, _timeout: Duration) -> Result<Option<CanFrame>> {
        Err(EngineError::DriverUnavailable(
            "Demo driver does not support blocking receive".to_string(),
        ))
    }

    fn flush_receive_queue(&self) -> Result<()> {
        Ok(())
    }

    fn last_error(&self) -> String {
        String::new()
    }

    fn subscribe(&self) -> Receiver<DriverEvent> {
        self.hub.subscribe()
    }

    fn service(&self, now: Instant) {
        let mut run = self.run.lock();
        let Some(started) = run.started.filter(|_| run.open) else {
            return;
        };
        let due = (now.saturating_duration_since(started).as_nanos() / TICK.as_nanos()) as u64;
        if due > run.tick + MAX_CATCH_UP_TICKS {
            log::debug!(
                "[DemoDriver] Behind by {} ticks, skipping ahead",
                due - run.tick
            );
            run.tick = due - MAX_CATCH_UP_TICKS;
        }

        let profile = self.profile.lock();
        while run.tick < due {
            run.tick += 1;
            for frame in profile.frames_for_tick(run.tick) {
                self.hub.publish(DriverEvent::FrameReceived(frame));
            }
        }
    }

    fn set_simulation_database(&self, db: &SignalDatabase) {
        *self.profile.lock() = SimulationProfile::from_database(db);
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_frame;

    fn frames_ids(frames: &[CanFrame]) -> Vec<u32> {
        frames.iter().map(|f| f.id).collect()
    }

    fn test_database() -> SignalDatabase {
        SignalDatabase::from_messages(vec![
            MessageDefinition {
                id: 0x300,
                is_extended: false,
                name: "Status".to_string(),
                dlc: 8,
                transmitter: String::new(),
                signals: vec![
                    SignalDefinition::new("Gear", 0, 4)
                        .with_value_description(0, "P")
                        .with_value_description(1, "R")
                        .with_value_description(2, "N")
                        .with_value_description(3, "D"),
                    SignalDefinition::new("Speed", 8, 16)
                        .with_scaling(0.01, 0.0)
                        .with_range(0.0, 250.0),
                    SignalDefinition::new("Brake", 24, 1),
                ],
            },
            MessageDefinition {
                id: 0x100,
                is_extended: false,
                name: "Mux".to_string(),
                dlc: 4,
                transmitter: String::new(),
                signals: vec![
                    SignalDefinition::new("Sel", 0, 8).with_mux(MuxIndicator::Selector),
                    SignalDefinition::new("A", 8, 8)
                        .with_mux(MuxIndicator::Multiplexed(1))
                        .with_range(0.0, 100.0),
                    SignalDefinition::new("B", 8, 8)
                        .with_mux(MuxIndicator::Multiplexed(2))
                        .with_range(0.0, 100.0),
                ],
            },
            MessageDefinition {
                id: 0x200,
                is_extended: false,
                name: "Fd".to_string(),
                dlc: 15,
                transmitter: String::new(),
                signals: vec![SignalDefinition::new("X", 0, 8)],
            },
        ])
    }

    #[test]
    fn test_builtin_schedule() {
        let profile = SimulationProfile::builtin();
        assert_eq!(frames_ids(&profile.frames_for_tick(1)), vec![0x0C4]);
        assert_eq!(frames_ids(&profile.frames_for_tick(2)), vec![0x0C4, 0x153]);
        assert_eq!(frames_ids(&profile.frames_for_tick(10)), vec![0x0C4, 0x153, 0x1A0]);
        assert_eq!(
            frames_ids(&profile.frames_for_tick(500)),
            vec![0x0C4, 0x153, 0x1A0, 0x6B2, 0x7DF]
        );
    }

    #[test]
    fn test_builtin_payload_at_time_zero() {
        let frames = SimulationProfile::builtin().frames_for_tick(0);
        assert_eq!(frames.len(), 5);

        // rpm 1400 / 0.25, throttle 30 / 0.5, coolant 85 + 40
        assert_eq!(frames[0].payload(), &[0xE0, 0x15, 60, 125, 0, 0, 0, 0]);
        // speed 60 / 0.01, brake 5, steering 0
        assert_eq!(frames[1].payload(), &[0x70, 0x17, 5, 0, 0, 0, 0, 0]);
        // fuel 65 / 0.4, odometer 0, ambient (22 + 40) / 0.5
        assert_eq!(frames[2].payload(), &[162, 0, 124, 0, 0, 0, 0, 0]);
        assert_eq!(frames[3].payload()[0], 0x02);
        assert_eq!(frames[4].payload(), &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(frames.iter().all(|f| f.channel == 1 && f.timestamp_ns == 0));
    }

    #[test]
    fn test_database_plan_selection() {
        let profile = SimulationProfile::from_database(&test_database());
        assert!(profile.is_database_driven());
        assert_eq!(
            profile.schedule(),
            vec![(0x100, Duration::from_millis(10)), (0x300, Duration::from_millis(20))]
        );
        assert_eq!(frames_ids(&profile.frames_for_tick(1)), vec![0x100]);
        assert_eq!(frames_ids(&profile.frames_for_tick(2)), vec![0x100, 0x300]);
    }

    #[test]
    fn test_generated_values_decode() {
        let db = test_database();
        let profile = SimulationProfile::from_database(&db);

        for tick in [0u64, 2, 4, 6, 100, 1234] {
            for frame in profile.frames_for_tick(tick) {
                let decoded = decode_frame(&frame, &db).expect("generated ids are known");
                for signal in &decoded.signals {
                    match signal.name.as_str() {
                        "Gear" => assert!(signal.value_description.is_some()),
                        "Speed" => assert!((0.0..=250.0).contains(&signal.physical)),
                        "A" | "B" => assert!((0.0..=100.0).contains(&signal.physical)),
                        _ => {}
                    }
                }
            }
        }
    }

    #[test]
    fn test_mux_branch_rotates() {
        let db = test_database();
        let profile = SimulationProfile::from_database(&db);

        let selector_at = |tick| {
            let frame = profile.frames_for_tick(tick)[0];
            decode_frame(&frame, &db).and_then(|m| m.multiplexer_value)
        };
        // Plan 0, period 1: values [1, 2] indexed by tick
        assert_eq!(selector_at(1), Some(2));
        assert_eq!(selector_at(2), Some(1));
        assert_eq!(selector_at(3), Some(2));
    }

    #[test]
    fn test_empty_database_falls_back() {
        let profile = SimulationProfile::from_database(&SignalDatabase::new());
        assert!(!profile.is_database_driven());
        assert_eq!(frames_ids(&profile.frames_for_tick(1)), vec![0x0C4]);
    }

    #[test]
    fn test_driver_lifecycle_and_service() {
        let driver = SimulatedDriver::new();
        let events = driver.subscribe();
        let channel = driver.detect_channels().remove(0);
        assert_eq!(channel.name, "Demo Channel 1");

        driver.open_channel(&channel, &BusConfig::default()).unwrap();
        assert_eq!(events.try_recv().ok(), Some(DriverEvent::ChannelOpened));
        let err = driver.open_channel(&channel, &BusConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to open channel: Already open");

        let start = driver.run.lock().started.unwrap();
        driver.service(start + Duration::from_millis(35));
        assert_eq!(driver.tick(), 3);
        let frames: Vec<_> = events.try_iter().collect();
        assert_eq!(frames.len(), 4); // 0x0C4 x3 + 0x153 at tick 2

        // A long stall only replays the cap
        driver.service(start + Duration::from_secs(60));
        assert_eq!(driver.tick(), 6000);
        let replayed = events.try_iter().count();
        assert!(replayed >= MAX_CATCH_UP_TICKS as usize);

        driver.close_channel();
        assert_eq!(events.try_recv().ok(), Some(DriverEvent::ChannelClosed));
        driver.service(start + Duration::from_secs(120));
        assert_eq!(driver.tick(), 6000);
    }

    #[test]
    fn test_transmit_echo() {
        let driver = SimulatedDriver::new();
        let events = driver.subscribe();
        driver.transmit(&CanFrame::classic(0x7E0, &[1, 2])).unwrap();
        match events.try_recv() {
            Ok(DriverEvent::FrameReceived(frame)) => {
                assert!(frame.is_tx_echo);
                assert_eq!(frame.id, 0x7E0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(driver.receive(Duration::from_millis(1)).is_err());
    }
}
