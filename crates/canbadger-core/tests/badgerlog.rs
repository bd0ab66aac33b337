use canbadger_core::record::flags;
use canbadger_core::{CanFrame, LogRecord};
use canbadger_test::{CommandExt, tool};
use pretty_assertions::assert_eq;

#[test]
fn test_log_to_csv() {
    let first = LogRecord::from_can_frame(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]), 1, 10, 500_000);
    let second =
        LogRecord::from_can_frame(&CanFrame::new(0x18DAF110, &[0xAA, 0xBB]), 2, 22, 250_000);
    let mut input = first.encode();
    // a wraparound gap between the records
    input.extend_from_slice(&[0, 0, 0, 0]);
    input.extend_from_slice(&second.encode());

    let output = tool!("badgerlog")
        .write_stdin(input)
        .captured_output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let expected = "\
        timestamp_ms,bus,proto,canid,format,dlc,bitrate,data\n\
        10,1,can,0x7E0,standard,3,500000,021003\n\
        22,2,can,0x18DAF110,extended,2,250000,AABB\n\
    ";
    assert_eq!(stdout, expected);
}

#[test]
fn test_kline_records_are_labelled() {
    let record = LogRecord {
        flags: flags::BUS1 | flags::KLINE,
        timestamp_ms: 5,
        id: 0x0010_00F1,
        bitrate: 10_400,
        payload: vec![0x81],
    };
    let output = tool!("badgerlog")
        .write_stdin(record.encode())
        .captured_output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("5,1,kline,0x1000F1,standard,1,10400,81"));
}
