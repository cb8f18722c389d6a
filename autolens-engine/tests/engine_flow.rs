// Capture, export and re-import through the engine with the Demo driver
use autolens_engine::{
    DisplayMode, Engine, EngineEvent, EngineState, SessionLog, Settings, SimulatedDriver,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn demo_engine() -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::with_driver(Settings::default(), Box::new(SimulatedDriver::new()))
}

#[test]
fn capture_save_and_reimport() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = demo_engine();
    let events = engine.subscribe();

    engine.start_init_sequence();
    assert!(engine.wait_for_init(Duration::from_secs(5)));
    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Measuring);

    let t0 = Instant::now();
    for step in 1..=10u64 {
        engine.poll(t0 + Duration::from_millis(100 * step));
    }
    engine.stop();
    let captured = engine.frame_count();
    assert!(captured > 0);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, EngineEvent::FrameCountChanged(n) if n > 0)));

    for name in ["capture.asc", "capture.blf"] {
        let path = dir.path().join(name);
        let path = path.to_string_lossy().into_owned();
        assert_eq!(engine.save_trace(&path).unwrap(), captured);

        let mut reader = demo_engine();
        assert_eq!(reader.import_trace(&path, false).unwrap(), captured);
        let original: Vec<_> = engine.model().entries().iter().map(|e| (e.frame.id, e.frame.payload().to_vec())).collect();
        let reloaded: Vec<_> = reader.model().entries().iter().map(|e| (e.frame.id, e.frame.payload().to_vec())).collect();
        assert_eq!(original, reloaded, "{} round trip", name);
    }

    let csv = dir.path().join("capture.csv");
    engine.save_trace(&csv.to_string_lossy()).unwrap();
    let text = std::fs::read_to_string(&csv).unwrap();
    assert_eq!(text.lines().count(), captured + 1);

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Closed);
}

#[test]
fn transmit_echo_reaches_trace_when_enabled() {
    let mut engine = demo_engine();
    engine.start().unwrap();
    engine.pipeline().set_drop_tx_echo(false);

    engine.send_frame(0x7A0, "DE AD BE EF", false).unwrap();
    engine.poll(Instant::now() + Duration::from_millis(60));

    let echo = engine
        .model()
        .entries()
        .iter()
        .find(|e| e.frame.id == 0x7A0)
        .expect("echo row");
    assert_eq!(echo.direction, "Tx");
    assert_eq!(echo.frame.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn in_place_mode_keeps_one_row_per_id() {
    let mut engine = demo_engine();
    engine.set_display_mode(DisplayMode::InPlace);
    engine.start().unwrap();
    engine.poll(Instant::now() + Duration::from_millis(500));

    let mut ids: Vec<u32> = engine.model().entries().iter().map(|e| e.frame.id).collect();
    let rows = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), rows);
}

#[test]
fn session_log_closed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(SessionLog::open(dir.path(), "test").unwrap());
    let marker = sink.crash_marker_path();
    assert!(marker.exists());

    let mut engine = demo_engine().with_log_sink(Arc::clone(&sink));
    engine.connect_channels().unwrap();
    engine.shutdown();

    assert!(!marker.exists());
    let log = std::fs::read_to_string(sink.session_path()).unwrap();
    assert!(log.contains("Messages:"));
}
