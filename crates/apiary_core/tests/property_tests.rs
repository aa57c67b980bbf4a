//! Property tests for the wire envelope.

use apiary_core::{Frame, Message};
use proptest::prelude::*;
use serde_json::json;

fn arb_kind() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("ping".to_string()),
        Just("agent.register".to_string()),
        Just("task.result".to_string()),
        Just("client.agent.task.create.request".to_string()),
        "[a-z]{1,8}\\.[a-z]{1,8}",
    ]
}

proptest! {
    #[test]
    fn frame_roundtrips_through_wire_text(
        kind in arb_kind(),
        key in "[a-z]{1,8}",
        value in "[a-zA-Z0-9 ]{0,32}",
        with_request_id in any::<bool>(),
    ) {
        let mut frame = Frame::new(kind.as_str(), json!({ key.clone(): value.clone() }));
        if with_request_id {
            frame = frame.with_request_id("req-1");
        }
        let back = Frame::parse(&frame.to_text()).unwrap();
        prop_assert_eq!(back, frame);
    }

    #[test]
    fn minted_ids_are_unique(n in 2usize..16) {
        let ids: Vec<String> = (0..n).map(|_| Frame::new("ping", json!({})).id).collect();
        let mut dedup = ids.clone();
        dedup.sort();
        dedup.dedup();
        prop_assert_eq!(dedup.len(), ids.len());
    }

    #[test]
    fn decode_never_panics(kind in "[a-z.]{0,24}", text in "[ -~]{0,64}") {
        let content = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        let _ = Message::decode_parts(&kind, content);
    }
}
