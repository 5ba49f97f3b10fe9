use super::*;

fn sample_request() -> RpcMessage {
    let mut msg = RpcMessage::request("req-1", "ping", vec![1, 2, 3]);
    msg.header.insert("peer".to_owned(), "node-a".to_owned());
    msg
}

#[test]
fn error_type_numeric_mapping_matches_wire_enum() {
    assert_eq!(ErrorType::ServerTimeout.as_i32(), 0);
    assert_eq!(ErrorType::ClientTimeout.as_i32(), 1);
    assert_eq!(ErrorType::UnknownMethod.as_i32(), 2);
    assert_eq!(ErrorType::ClientError.as_i32(), 3);
    assert_eq!(ErrorType::ServerError.as_i32(), 4);
}

#[test]
fn error_type_from_wire_rejects_out_of_range_value() {
    let err = ErrorType::from_i32(99).expect_err("error type should be invalid");
    assert!(matches!(err, CodecError::InvalidErrorType(99)));
}

#[test]
fn request_carries_method_and_request_marker() {
    let msg = sample_request();
    assert_eq!(msg.method(), Some("ping"));
    assert!(msg.is_request());
    assert!(!msg.is_response());
    assert!(!msg.is_notification());
    assert!(msg.error_type.is_none());
}

#[test]
fn reply_echoes_request_id_and_method() {
    let req = sample_request();
    let reply = req.reply(vec![9]);
    assert_eq!(reply.request_id, "req-1");
    assert_eq!(reply.method(), Some("ping"));
    assert!(reply.is_response());
    assert!(!reply.header.contains_key("peer"));
    assert_eq!(reply.body, vec![9]);
}

#[test]
fn error_reply_has_empty_body_and_diagnostics() {
    let req = sample_request();
    let details = ErrorDetails {
        class_name: Some("BoomError".to_owned()),
        code: Some("E_BOOM".to_owned()),
        message: Some("boom".to_owned()),
    };
    let reply = req.error_reply(ErrorType::ServerError, details.clone());
    assert!(reply.body.is_empty());
    assert_eq!(reply.error_type, Some(ErrorType::ServerError));
    assert_eq!(reply.error, details);
}

#[test]
fn encode_decode_preserves_request() {
    let msg = sample_request();
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    assert_eq!(decoded, msg);
}

#[test]
fn encode_decode_preserves_error_reply() {
    let reply = sample_request().error_reply(
        ErrorType::UnknownMethod,
        ErrorDetails { message: Some("RPC method ping is not provided".to_owned()), ..ErrorDetails::default() },
    );
    let decoded = decode_message(&encode_message(&reply)).expect("decode should succeed");
    assert_eq!(decoded.error_type, Some(ErrorType::UnknownMethod));
    assert_eq!(decoded.error.message.as_deref(), Some("RPC method ping is not provided"));
    assert!(decoded.error.class_name.is_none());
}

#[test]
fn server_timeout_survives_encoding_despite_zero_value() {
    let reply = sample_request().error_reply(ErrorType::ServerTimeout, ErrorDetails::default());
    let decoded = decode_message(&encode_message(&reply)).expect("decode should succeed");
    assert_eq!(decoded.error_type, Some(ErrorType::ServerTimeout));
}

#[test]
fn encoder_drops_diagnostics_without_error_type() {
    let mut msg = sample_request();
    msg.error.message = Some("stray".to_owned());
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    assert!(decoded.error.is_empty());
}

#[test]
fn decode_rejects_orphan_diagnostics() {
    let wire = WireMessage {
        header: HashMap::new(),
        body: Vec::new(),
        request_id: "r".to_owned(),
        error_type: None,
        error_class_name: None,
        error_code: Some("E_X".to_owned()),
        error_message: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");
    let err = decode_message(&bytes).expect_err("orphan diagnostics should fail");
    assert!(matches!(err, CodecError::OrphanDiagnostics));
}

#[test]
fn decode_rejects_unknown_error_type() {
    let wire = WireMessage {
        header: HashMap::new(),
        body: Vec::new(),
        request_id: "r".to_owned(),
        error_type: Some(42),
        error_class_name: None,
        error_code: None,
        error_message: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");
    let err = decode_message(&bytes).expect_err("unknown error type should fail");
    assert!(matches!(err, CodecError::InvalidErrorType(42)));
}

#[test]
fn decode_rejects_garbage_bytes() {
    let err = decode_message(&[0xff, 0xff, 0xff]).expect_err("garbage should fail");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn notification_round_trips_marker() {
    let msg = RpcMessage::notification("n-1", "gossip", vec![7]);
    let decoded = decode_message(&encode_message(&msg)).expect("decode should succeed");
    assert!(decoded.is_notification());
    assert_eq!(decoded.method(), Some("gossip"));
}

#[test]
fn error_type_serializes_as_screaming_snake_case() {
    let json = serde_json::to_string(&ErrorType::UnknownMethod).expect("serialize");
    assert_eq!(json, "\"UNKNOWN_METHOD\"");
}
