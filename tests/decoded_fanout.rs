// Cross-module scenario: a frame arriving through the aggregator and the
// fan-out together should come out decoded, and the aggregator's count and
// last-decoded cache should reflect it — the two components never drift
// from what the same decoder call would give you in isolation.

use std::sync::Arc;

use canbridge_lib::aggregator::Aggregator;
use canbridge_lib::decoder::DecoderAdapter;
use canbridge_lib::fanout::{FanOut, SessionSubscriber};
use canbridge_lib::frame::Frame;
use canbridge_lib::symboldb::CanDbcDatabase;

const DBC: &str = r#"VERSION ""

NS_ :

BS_:

BU_: ECU

BO_ 2566848512 BatteryState: 8 ECU
 SG_ SOC : 0|8@1+ (1,0) [0|100] "%" ECU
"#;

fn load_dbc() -> Arc<CanDbcDatabase> {
    let db = CanDbcDatabase::empty();
    db.load(DBC.as_bytes()).expect("dbc parses");
    Arc::new(db)
}

#[test]
fn decoded_frame_reaches_subscriber_and_updates_aggregator_in_lockstep() {
    let db = load_dbc();
    let decoder = DecoderAdapter::new(db);
    let aggregator = Aggregator::new();
    let fanout = FanOut::new();
    let session = SessionSubscriber::new(8);
    fanout.attach_session(session.clone());

    // 0x18FF0000 as a 29-bit extended id: matches the message defined above
    // (can-dbc encodes extended message ids with the top bit set in BO_).
    let frame = Frame::new(0x18FF0000, true, false, vec![42, 0, 0, 0, 0, 0, 0, 0], 1.0);

    aggregator.observe(&frame, &decoder);
    let decoded = decoder.decode(frame.id(), frame.extended(), frame.data());
    fanout.dispatch(&frame, decoded.clone());

    let decoded = decoded.expect("schema should have matched");
    assert_eq!(decoded.message_name, "BatteryState");
    assert_eq!(decoded.signals[0].name, "SOC");
    assert_eq!(decoded.signals[0].value, "42.0");

    let stats = aggregator.get(0x18FF0000, true).expect("stats entry created");
    assert_eq!(stats.count, 1);
    assert_eq!(stats.last_decoded.as_ref().unwrap().message_name, "BatteryState");

    let (received, dropped) = session.recv().expect("subscriber should have the frame");
    assert_eq!(dropped, 0);
    assert_eq!(received.frame, frame);
    assert_eq!(received.decoded.unwrap().signals[0].value, "42.0");
}

#[test]
fn unmatched_frame_passes_through_undecoded_but_still_counted() {
    let db = load_dbc();
    let decoder = DecoderAdapter::new(db);
    let aggregator = Aggregator::new();
    let fanout = FanOut::new();
    let session = SessionSubscriber::new(8);
    fanout.attach_session(session.clone());

    let frame = Frame::new(0x123, false, false, vec![1, 2, 3], 1.0);
    aggregator.observe(&frame, &decoder);
    let decoded = decoder.decode(frame.id(), frame.extended(), frame.data());
    assert!(decoded.is_none());
    fanout.dispatch(&frame, decoded);

    assert_eq!(aggregator.get(0x123, false).unwrap().count, 1);
    assert!(aggregator.get(0x123, false).unwrap().last_decoded.is_none());
    let (received, _) = session.recv().unwrap();
    assert!(received.decoded.is_none());
}
