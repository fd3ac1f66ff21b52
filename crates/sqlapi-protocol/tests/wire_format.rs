//! Wire-format contract tests.
//!
//! These pin the frozen byte layouts a deployed peer depends on: request
//! field order, the three response shapes, the integer narrowing rule, and
//! the framed transport behavior.  Changing any expected byte sequence here
//! is a protocol break.

use sqlapi_protocol::{
    ErrorCode, Request, RequestKind, Response, ResponseKind, Value, read_ack, read_frame,
    write_ack, write_frame,
};

#[test]
fn register_request_bytes() {
    let req = Request::control(4242, RequestKind::Register);
    let frame = req.to_frame();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4242i32.to_le_bytes());
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.push(0); // Null item key
    expected.extend_from_slice(&0u32.to_le_bytes()); // empty payload
    assert_eq!(&frame[..], &expected[..]);
}

#[test]
fn write_row_request_carries_typed_key_and_sql() {
    let req = Request {
        client_id: 1,
        kind: RequestKind::WriteRow,
        item_key: Value::Text("row-1".to_owned()),
        payload: "INSERT INTO t VALUES ('row-1','7')".to_owned(),
    };
    let decoded = Request::from_frame(&req.to_frame()).unwrap();
    assert_eq!(decoded, req);
}

#[test]
fn long_integers_are_clipped_to_32_bits_in_request_keys() {
    let req = Request {
        client_id: 1,
        kind: RequestKind::SubscribeKey,
        item_key: Value::Int(i64::MAX),
        payload: String::new(),
    };
    let decoded = Request::from_frame(&req.to_frame()).unwrap();
    // i64::MAX truncates to -1 as i32; the clip is silent by contract.
    assert_eq!(decoded.item_key, Value::Int(-1));
}

#[test]
fn response_shapes_are_discriminated_by_kind() {
    let confirmation = Response::Confirmation.to_frame();
    assert_eq!(confirmation.len(), 4);

    let notify = Response::Delete(Value::Text("k".to_owned())).to_frame();
    assert_eq!(&notify[0..4], &10i32.to_le_bytes());
    // No status word between kind and key.
    assert_eq!(notify[4], 5); // Text tag

    let data = Response::data(
        ResponseKind::Count,
        ErrorCode::NoError,
        vec![Value::Int(3)],
    )
    .to_frame();
    assert_eq!(&data[0..4], &5i32.to_le_bytes());
    assert_eq!(&data[4..8], &0i32.to_le_bytes());
}

#[test]
fn item_data_body_is_a_flat_run_of_cells() {
    let row = vec![Value::Text("row-1".to_owned()), Value::Int(7)];
    let frame = Response::data(ResponseKind::ItemData, ErrorCode::NoError, row.clone()).to_frame();
    match Response::from_frame(&frame).unwrap() {
        Response::Data { kind, status, body } => {
            assert_eq!(kind, ResponseKind::ItemData);
            assert_eq!(status, ErrorCode::NoError);
            assert_eq!(body, row);
        }
        other => panic!("expected Data, got {other:?}"),
    }
}

#[test]
fn garbage_frames_decode_to_errors() {
    assert!(Request::from_frame(b"").is_err());
    assert!(Request::from_frame(&[0u8; 8]).is_err()); // kind 0 is not a request
    assert!(Response::from_frame(&99i32.to_le_bytes()).is_err());
}

#[tokio::test]
async fn request_ack_exchange_over_a_pipe() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    let req = Request::control(9, RequestKind::CancelLast);
    write_frame(&mut client, &req.to_frame()).await.unwrap();

    let frame = read_frame(&mut server).await.unwrap().unwrap();
    assert_eq!(Request::from_frame(&frame).unwrap(), req);
    write_ack(&mut server).await.unwrap();

    read_ack(&mut client).await.unwrap();
    drop(client);
    // Peer close after ACK is the normal end of a request exchange.
    assert!(read_frame(&mut server).await.unwrap().is_none());
}
