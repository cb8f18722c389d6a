// End-to-end checks of decoding, file formats and trace eviction
use autolens_engine::formats::asc::format_frame_line;
use autolens_engine::formats::blf::write_blf_file;
use autolens_engine::formats::BlfParser;
use autolens_engine::formats::LogFileParser;
use autolens_engine::trace::{MAX_ROWS, PURGE_CHUNK};
use autolens_engine::{decode_frame, parse_dbc_str, CanFrame, SignalDatabase, TraceEntry, TraceModel};
use std::path::Path;

fn database(dbc: &str) -> SignalDatabase {
    let load = parse_dbc_str(dbc);
    assert!(load.issues.is_empty(), "unexpected issues: {:?}", load.issues);
    load.database
}

fn physical(db: &SignalDatabase, frame: &CanFrame, name: &str) -> f64 {
    let decoded = decode_frame(frame, db).expect("message known");
    decoded
        .signals
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.physical)
        .unwrap_or_else(|| panic!("signal {} missing", name))
}

#[test]
fn classic_little_endian_decode() {
    let db = database(
        r#"
VERSION ""

BU_: ECU

BO_ 196 EngineData: 8 ECU
 SG_ EngineRPM : 0|16@1+ (0.25,0) [0|16000] "rpm" Vector__XXX
 SG_ ThrottlePos : 16|8@1+ (0.5,0) [0|100] "%" Vector__XXX
"#,
    );
    let frame = CanFrame::classic(0x0C4, &[0xA0, 0x0F, 0x54, 0, 0, 0, 0, 0]);

    assert_eq!(physical(&db, &frame, "EngineRPM"), 1000.0);
    assert_eq!(physical(&db, &frame, "ThrottlePos"), 42.0);

    let entry = TraceEntry::new(frame, &db);
    assert_eq!(entry.name, "EngineData");
    assert_eq!(entry.signals[0].value, "1000 rpm");
    assert_eq!(entry.signals[0].raw, "0xFA0");
    assert_eq!(entry.signals[1].value, "42 %");
}

#[test]
fn signed_motorola_decode() {
    let db = database(
        r#"
BO_ 293 Steering: 8 ECU
 SG_ SteerAngle : 7|16@0- (0.1,0) [-3276.8|3276.7] "deg" Vector__XXX
"#,
    );
    let frame = CanFrame::classic(0x125, &[0xFE, 0x0C, 0, 0, 0, 0, 0, 0]);
    let decoded = decode_frame(&frame, &db).unwrap();

    assert_eq!(decoded.signals[0].raw, -500);
    assert!((decoded.signals[0].physical + 50.0).abs() < 1e-9);
    assert_eq!(decoded.signals[0].raw_text, "0xFE0C");
}

#[test]
fn multiplexed_rows_follow_selector() {
    let db = database(
        r#"
BO_ 1280 Temperatures: 8 ECU
 SG_ Mux M : 0|4@1+ (1,0) [0|15] "" Vector__XXX
 SG_ Tmp1 m1 : 8|8@1+ (1,-40) [-40|215] "degC" Vector__XXX
 SG_ Tmp2 m2 : 8|8@1+ (1,-40) [-40|215] "degC" Vector__XXX
"#,
    );

    let names = |byte0: u8| -> Vec<String> {
        let frame = CanFrame::classic(0x500, &[byte0, 100, 0, 0, 0, 0, 0, 0]);
        TraceEntry::new(frame, &db)
            .signals
            .into_iter()
            .map(|s| s.name)
            .filter(|n| n != "Mux")
            .collect()
    };

    assert_eq!(names(0x02), vec!["Tmp2".to_string()]);
    assert_eq!(names(0x01), vec!["Tmp1".to_string()]);
    assert_eq!(names(0xF1), vec!["Tmp1".to_string()]);
}

#[test]
fn asc_line_for_extended_tx_frame() {
    let mut frame = CanFrame::classic(0x18DB33F1, &[0x01, 0x02, 0x03, 0x04])
        .on_channel(2)
        .at(1_234_567_000);
    frame.is_tx_echo = true;

    let line = format_frame_line(&frame);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(
        tokens,
        vec!["1.234567", "2", "18DB33F1x", "Tx", "d", "4", "01", "02", "03", "04"]
    );
    assert!(line.ends_with("01 02 03 04"));
}

#[test]
fn blf_header_back_patch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three.blf");
    let frames = [
        CanFrame::classic(0x100, &[1]).at(10_000),
        CanFrame::classic(0x200, &[2]).at(20_000),
        CanFrame::classic(0x300, &[3]).at(30_000),
    ];
    assert_eq!(write_blf_file(&path, &frames).unwrap(), 3);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
    assert_eq!(&bytes[32..40], &3000u64.to_le_bytes());
    assert_eq!(&bytes[144..148], b"LOBJ");
    assert_eq!(bytes.len(), 144 + 3 * 40);

    let read: Vec<CanFrame> = BlfParser::parse(Path::new(&path))
        .unwrap()
        .collect::<autolens_engine::Result<_>>()
        .unwrap();
    let ids: Vec<u32> = read.iter().map(|f| f.id).collect();
    assert_eq!(ids, vec![0x100, 0x200, 0x300]);
    assert_eq!(read[2].timestamp_ns, 30_000);
}

#[test]
fn append_eviction_drops_oldest_chunk() {
    let db = SignalDatabase::new();
    let mut model = TraceModel::new();
    let total = MAX_ROWS + 1;

    let mut batch = Vec::with_capacity(10_000);
    for i in 0..total {
        batch.push(TraceEntry::new(CanFrame::classic(0x100, &[1]).at(i as u64), &db));
        if batch.len() == 10_000 {
            model.add_entries(std::mem::take(&mut batch));
        }
    }
    model.add_entries(batch);

    assert!(model.frame_count() <= MAX_ROWS);
    assert_eq!(model.frame_count(), total - PURGE_CHUNK);
    assert_eq!(model.entries()[0].frame.timestamp_ns, PURGE_CHUNK as u64);
    assert_eq!(
        model.entries().last().unwrap().frame.timestamp_ns,
        (total - 1) as u64
    );
}
