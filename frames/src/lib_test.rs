use super::*;
use serde_json::json;

fn frame(kind: &str, payload: serde_json::Value) -> String {
    json!({ "type": kind, "payload": payload, "timestamp": "2026-01-05T10:00:00Z" }).to_string()
}

#[test]
fn kind_names_round_trip_for_known_kinds() {
    for kind in MessageKind::KNOWN {
        assert_eq!(MessageKind::parse(kind.as_str()), kind);
    }
}

#[test]
fn keepalive_alias_maps_to_ping() {
    assert_eq!(MessageKind::parse("keepalive"), MessageKind::Ping);
}

#[test]
fn unknown_kind_maps_to_other() {
    assert_eq!(MessageKind::parse("online_users"), MessageKind::Other("online_users".to_owned()));
    assert_eq!(MessageKind::Other("x".to_owned()).to_string(), "x");
}

#[test]
fn decode_chat_message_frame() {
    let text = frame(
        "chat_message",
        json!({
            "message_id": "m-1",
            "conversation_id": "c-1",
            "sender_id": "u-2",
            "sender_username": "budi",
            "encrypted_content": "halo",
            "created_at": "2026-01-05T10:00:00Z",
            "attachments": [{"id": "a-1", "file_name": "po.pdf", "file_size": 2048}]
        }),
    );
    let Message::ChatMessage(msg) = decode_frame(&text).expect("decode") else {
        panic!("expected chat message");
    };
    assert_eq!(msg.message_id, "m-1");
    assert_eq!(msg.sender_username, "budi");
    assert_eq!(msg.attachments.len(), 1);
    assert_eq!(msg.attachments[0].file_size, 2048);
    assert_eq!(msg.nonce, None);
}

#[test]
fn decode_notification_accepts_alias_fields() {
    let text = frame(
        "notification",
        json!({"title": "PO approved", "body": "PO-7 approved", "notification_type": "approval", "read": true}),
    );
    let Message::Notification(n) = decode_frame(&text).expect("decode") else {
        panic!("expected notification");
    };
    assert_eq!(n.message, "PO-7 approved");
    assert_eq!(n.notification_type.as_deref(), Some("approval"));
    assert!(n.is_read);
    assert_eq!(n.id, None);
}

#[test]
fn decode_record_lock_frame() {
    let text = frame(
        "record_lock",
        json!({"entity_type": "invoice", "entity_id": "inv-123", "user_id": "u-9", "user_email": "sari@malaka.id"}),
    );
    let msg = decode_frame(&text).expect("decode");
    assert_eq!(msg.kind(), MessageKind::RecordLock);
    let Message::RecordLock(lock) = msg else {
        panic!("expected record lock");
    };
    assert!(lock.is_for("invoice", "inv-123"));
    assert!(!lock.is_for("invoice", "inv-124"));
}

#[test]
fn decode_ping_ignores_payload() {
    let msg = decode_frame(r#"{"type":"ping"}"#).expect("decode");
    assert_eq!(msg, Message::Ping);
}

#[test]
fn unknown_kind_decodes_to_unrecognized() {
    let msg = decode_frame(&frame("online_users", json!({"count": 4}))).expect("decode");
    assert_eq!(msg, Message::Unrecognized { kind: "online_users".to_owned(), payload: json!({"count": 4}) });
    assert_eq!(msg.kind(), MessageKind::Other("online_users".to_owned()));
}

#[test]
fn dashboard_update_keeps_raw_payload() {
    let msg = decode_frame(&frame("dashboard_update", json!({"widget": "sales", "value": 12}))).expect("decode");
    assert_eq!(msg, Message::DashboardUpdate(json!({"widget": "sales", "value": 12})));
}

#[test]
fn malformed_json_is_envelope_error() {
    let err = decode_frame("{not json").expect_err("should fail");
    assert!(matches!(err, CodecError::Envelope(_)));
}

#[test]
fn missing_type_is_envelope_error() {
    let err = decode_frame(r#"{"payload":{}}"#).expect_err("should fail");
    assert!(matches!(err, CodecError::Envelope(_)));
}

#[test]
fn mismatched_payload_is_payload_error() {
    let err = decode_frame(&frame("typing_indicator", json!({"is_typing": "yes"}))).expect_err("should fail");
    assert!(matches!(err, CodecError::Payload { kind: "typing_indicator", .. }));
}

#[test]
fn outbound_typing_frame_omits_empty_user_id() {
    let msg = Message::TypingIndicator(TypingIndicatorPayload {
        conversation_id: "c-1".to_owned(),
        user_id: String::new(),
        is_typing: true,
    });
    let value: serde_json::Value = serde_json::from_str(&encode_frame_at(&msg, "ts")).expect("json");
    assert_eq!(
        value,
        json!({"type": "typing_indicator", "payload": {"conversation_id": "c-1", "is_typing": true}, "timestamp": "ts"})
    );
}

#[test]
fn ping_encodes_empty_object_payload() {
    let value: serde_json::Value = serde_json::from_str(&encode_frame_at(&Message::Ping, "ts")).expect("json");
    assert_eq!(value["type"], "ping");
    assert_eq!(value["payload"], json!({}));
}

#[test]
fn encode_frame_stamps_rfc3339_timestamp() {
    let envelope = decode_envelope(&encode_frame(&Message::Ping)).expect("envelope");
    assert!(envelope.timestamp.contains('T'), "timestamp was {}", envelope.timestamp);
    assert!(envelope.timestamp.ends_with('Z'));
}

#[test]
fn record_unlock_round_trips_through_envelope() {
    let msg = Message::RecordUnlock(RecordLockPayload {
        entity_type: "invoice".to_owned(),
        entity_id: "inv-1".to_owned(),
        user_id: "u-1".to_owned(),
        user_email: "a@b.c".to_owned(),
    });
    let decoded = decode_frame(&encode_frame(&msg)).expect("decode");
    assert_eq!(decoded, msg);
}
