// Unit tests for the wire codec and message framing

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian};
use tilemul::protocol::{self, MessageType, Task, TileResult, HEADER_LEN};
use tilemul::Matrix;

fn sample_task() -> Task {
    Task {
        task_id: 7,
        start_row: 64,
        end_row: 128,
        start_col: 0,
        end_col: 64,
        matrix_size: 300,
    }
}

#[test]
fn empty_payload_kinds_round_trip() {
    for msg_type in [
        MessageType::ClientConnect,
        MessageType::ClientDisconnect,
        MessageType::TaskRequest,
        MessageType::NoWork,
        MessageType::Shutdown,
    ] {
        let buf = protocol::encode_message(msg_type, &[]);
        assert_eq!(buf.len(), HEADER_LEN);
        let (parsed, payload) = protocol::decode_message(&buf).unwrap();
        assert_eq!(parsed, msg_type);
        assert!(payload.is_empty());
    }
}

#[test]
fn opaque_payload_round_trips() {
    let payload = vec![1u8, 2, 3, 4, 5];
    let buf = protocol::encode_message(MessageType::MatrixData, &payload);
    let (parsed, recovered) = protocol::decode_message(&buf).unwrap();
    assert_eq!(parsed, MessageType::MatrixData);
    assert_eq!(recovered, payload);
}

#[test]
fn matrix_payload_round_trip() {
    for (rows, cols) in [(1, 1), (3, 2), (2, 3), (64, 64)] {
        let data: Vec<f64> = (0..rows * cols).map(|x| x as f64 * 0.25 - 3.0).collect();
        let matrix = Matrix::from_vec(data, rows, cols).unwrap();

        let payload = protocol::serialize_matrix(&matrix);
        assert_eq!(payload.len(), 8 + 8 * rows * cols);

        let recovered = protocol::deserialize_matrix(&payload).unwrap();
        assert_eq!(recovered.rows, rows);
        assert_eq!(recovered.cols, cols);
        assert_eq!(recovered.data, matrix.data);
    }
}

#[test]
fn task_payload_round_trip() {
    let task = sample_task();
    let payload = protocol::serialize_task(&task);
    assert_eq!(payload.len(), 24);
    let recovered = protocol::deserialize_task(&payload).unwrap();
    assert_eq!(recovered, task);
}

#[test]
fn result_payload_round_trip() {
    let tile: Vec<f64> = (0..6).map(|x| x as f64 + 0.5).collect();
    let result = TileResult {
        task_id: 3,
        start_row: 10,
        end_row: 12,
        start_col: 4,
        end_col: 7,
        tile: tile.clone(),
        execution_time_ms: 12.75,
    };

    let payload = protocol::serialize_result(&result);
    assert_eq!(payload.len(), 20 + 8 * tile.len() + 8);

    let recovered = protocol::deserialize_result(&payload).unwrap();
    assert_eq!(recovered.task_id, 3);
    assert_eq!(recovered.start_row, 10);
    assert_eq!(recovered.end_row, 12);
    assert_eq!(recovered.start_col, 4);
    assert_eq!(recovered.end_col, 7);
    assert_eq!(recovered.tile, tile);
    assert_eq!(recovered.execution_time_ms, 12.75);
}

#[test]
fn result_payload_with_wrong_tile_length_is_rejected() {
    let result = TileResult {
        task_id: 1,
        start_row: 0,
        end_row: 2,
        start_col: 0,
        end_col: 2,
        tile: vec![0.0; 4],
        execution_time_ms: 1.0,
    };
    let mut payload = protocol::serialize_result(&result);
    // Claim a 3x2 tile while carrying 2x2 worth of data.
    LittleEndian::write_i32(&mut payload[8..12], 3);
    assert!(protocol::deserialize_result(&payload).is_err());
}

#[test]
fn cpu_info_round_trip() {
    let payload = protocol::serialize_cpu_info(3.6);
    assert_eq!(payload.len(), 8);
    assert_eq!(protocol::deserialize_cpu_info(&payload).unwrap(), 3.6);
    assert!(protocol::deserialize_cpu_info(&payload[..4]).is_err());
}

#[test]
fn framing_recovers_message_sequence() {
    let matrix = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
    let task = sample_task();

    let mut stream = Vec::new();
    protocol::send_message(&mut stream, MessageType::CpuInfo, &protocol::serialize_cpu_info(2.4))
        .unwrap();
    protocol::send_message(
        &mut stream,
        MessageType::MatrixData,
        &protocol::serialize_matrix(&matrix),
    )
    .unwrap();
    protocol::send_message(&mut stream, MessageType::TaskRequest, &[]).unwrap();
    protocol::send_message(
        &mut stream,
        MessageType::TaskResponse,
        &protocol::serialize_task(&task),
    )
    .unwrap();
    protocol::send_message(&mut stream, MessageType::Shutdown, &[]).unwrap();

    let mut reader = Cursor::new(stream);

    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::CpuInfo);
    assert_eq!(protocol::deserialize_cpu_info(&payload).unwrap(), 2.4);

    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::MatrixData);
    let recovered = protocol::deserialize_matrix(&payload).unwrap();
    assert_eq!(recovered.data, matrix.data);

    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::TaskRequest);
    assert!(payload.is_empty());

    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::TaskResponse);
    assert_eq!(protocol::deserialize_task(&payload).unwrap(), task);

    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::Shutdown);
    assert!(payload.is_empty());

    // The stream is exhausted: further reads are end-of-stream.
    let (msg_type, _) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::ClientDisconnect);
}

#[test]
fn truncated_header_reads_as_disconnect() {
    let buf = protocol::encode_message(MessageType::TaskRequest, &[]);
    let mut reader = Cursor::new(buf[..HEADER_LEN - 3].to_vec());
    let (msg_type, payload) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::ClientDisconnect);
    assert!(payload.is_empty());
}

#[test]
fn truncated_payload_reads_as_disconnect() {
    let buf = protocol::encode_message(MessageType::MatrixData, &[0u8; 16]);
    let mut reader = Cursor::new(buf[..buf.len() - 1].to_vec());
    let (msg_type, _) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::ClientDisconnect);
}

#[test]
fn absurd_payload_length_reads_as_disconnect() {
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], MessageType::MatrixData as u32);
    LittleEndian::write_u64(&mut header[4..12], u64::MAX);
    let mut reader = Cursor::new(header.to_vec());
    let (msg_type, _) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::ClientDisconnect);
}

#[test]
fn unknown_message_type_reads_as_disconnect() {
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], 99);
    LittleEndian::write_u64(&mut header[4..12], 0);
    let mut reader = Cursor::new(header.to_vec());
    let (msg_type, _) = protocol::receive_message(&mut reader);
    assert_eq!(msg_type, MessageType::ClientDisconnect);
}

#[test]
fn malformed_matrix_payloads_are_rejected() {
    // Too short for the dimension header.
    assert!(protocol::deserialize_matrix(&[0u8; 4]).is_err());

    // Negative dimensions.
    let mut payload = vec![0u8; 8];
    LittleEndian::write_i32(&mut payload[0..4], -1);
    LittleEndian::write_i32(&mut payload[4..8], 2);
    assert!(protocol::deserialize_matrix(&payload).is_err());

    // Dimension header disagrees with the data length.
    let matrix = Matrix::new(2, 2);
    let mut payload = protocol::serialize_matrix(&matrix);
    payload.pop();
    assert!(protocol::deserialize_matrix(&payload).is_err());
}

#[test]
fn malformed_task_payloads_are_rejected() {
    assert!(protocol::deserialize_task(&[0u8; 23]).is_err());

    // Negative field.
    let mut payload = protocol::serialize_task(&sample_task());
    LittleEndian::write_i32(&mut payload[4..8], -5);
    assert!(protocol::deserialize_task(&payload).is_err());

    // Inverted row bounds.
    let mut payload = protocol::serialize_task(&sample_task());
    LittleEndian::write_i32(&mut payload[4..8], 100);
    LittleEndian::write_i32(&mut payload[8..12], 50);
    assert!(protocol::deserialize_task(&payload).is_err());
}
