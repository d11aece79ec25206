//! Framed binary protocol between the master and its workers.
//!
//! Every message is a fixed header (`message_type: u32`, `payload_len: u64`,
//! both little-endian) followed by `payload_len` payload bytes. Payloads carry
//! matrices, tasks, computed tiles, or a single scalar, encoded little-endian
//! with no padding.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::matrix::Matrix;

/// Bytes in the frame header: message type plus payload length.
pub const HEADER_LEN: usize = 12;

/// Frames declaring a larger payload are treated as a broken stream.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    ClientConnect = 1,
    ClientDisconnect = 2,
    TaskRequest = 3,
    TaskResponse = 4,
    MatrixData = 5,
    ComputationResult = 6,
    NoWork = 7,
    Shutdown = 8,
    CpuInfo = 9,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::ClientConnect),
            2 => Some(MessageType::ClientDisconnect),
            3 => Some(MessageType::TaskRequest),
            4 => Some(MessageType::TaskResponse),
            5 => Some(MessageType::MatrixData),
            6 => Some(MessageType::ComputationResult),
            7 => Some(MessageType::NoWork),
            8 => Some(MessageType::Shutdown),
            9 => Some(MessageType::CpuInfo),
            _ => None,
        }
    }
}

/// One unit of work: a rectangular tile of the output matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub task_id: usize,
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
    /// The shared inner dimension (A.cols = B.rows).
    pub matrix_size: usize,
}

impl Task {
    pub fn tile_rows(&self) -> usize {
        self.end_row - self.start_row
    }

    pub fn tile_cols(&self) -> usize {
        self.end_col - self.start_col
    }
}

/// The computed tile for one task, echoing the task bounds.
#[derive(Debug, Clone)]
pub struct TileResult {
    pub task_id: usize,
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
    /// Row-major within the tile, `tile_rows * tile_cols` values.
    pub tile: Vec<f64>,
    /// Wall-clock the worker spent in the compute kernel.
    pub execution_time_ms: f64,
}

/// Serialize a matrix as `rows:i32 | cols:i32 | rows*cols f64`
pub fn serialize_matrix(matrix: &Matrix) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + matrix.data.len() * 8];
    LittleEndian::write_i32(&mut buf[0..4], matrix.rows as i32);
    LittleEndian::write_i32(&mut buf[4..8], matrix.cols as i32);
    LittleEndian::write_f64_into(&matrix.data, &mut buf[8..]);
    buf
}

/// Deserialize a matrix payload
pub fn deserialize_matrix(data: &[u8]) -> Result<Matrix, Error> {
    if data.len() < 8 {
        return Err(Error::Malformed(format!(
            "matrix payload is {} bytes, need at least 8",
            data.len()
        )));
    }
    let rows = LittleEndian::read_i32(&data[0..4]);
    let cols = LittleEndian::read_i32(&data[4..8]);
    if rows < 0 || cols < 0 {
        return Err(Error::Malformed(format!(
            "matrix dimensions {}x{} are negative",
            rows, cols
        )));
    }
    let (rows, cols) = (rows as usize, cols as usize);
    let expected = 8 + rows * cols * 8;
    if data.len() != expected {
        return Err(Error::Malformed(format!(
            "matrix payload is {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    let mut values = vec![0.0f64; rows * cols];
    LittleEndian::read_f64_into(&data[8..], &mut values);
    Matrix::from_vec(values, rows, cols)
}

/// Serialize a task as six consecutive i32 values
pub fn serialize_task(task: &Task) -> Vec<u8> {
    let fields = [
        task.task_id,
        task.start_row,
        task.end_row,
        task.start_col,
        task.end_col,
        task.matrix_size,
    ];
    let mut buf = vec![0u8; 24];
    for (i, value) in fields.iter().enumerate() {
        LittleEndian::write_i32(&mut buf[i * 4..(i + 1) * 4], *value as i32);
    }
    buf
}

/// Deserialize a task payload
pub fn deserialize_task(data: &[u8]) -> Result<Task, Error> {
    if data.len() != 24 {
        return Err(Error::Malformed(format!(
            "task payload is {} bytes, expected 24",
            data.len()
        )));
    }
    let mut fields = [0usize; 6];
    for (i, field) in fields.iter_mut().enumerate() {
        let value = LittleEndian::read_i32(&data[i * 4..(i + 1) * 4]);
        if value < 0 {
            return Err(Error::Malformed(format!("task field {} is negative", i)));
        }
        *field = value as usize;
    }
    let [task_id, start_row, end_row, start_col, end_col, matrix_size] = fields;
    if end_row < start_row || end_col < start_col {
        return Err(Error::Malformed(format!(
            "task {} has inverted bounds",
            task_id
        )));
    }
    Ok(Task {
        task_id,
        start_row,
        end_row,
        start_col,
        end_col,
        matrix_size,
    })
}

/// Serialize a result: five i32 bounds, the tile data, then the kernel time
pub fn serialize_result(result: &TileResult) -> Vec<u8> {
    let fields = [
        result.task_id,
        result.start_row,
        result.end_row,
        result.start_col,
        result.end_col,
    ];
    let tile_bytes = result.tile.len() * 8;
    let mut buf = vec![0u8; 20 + tile_bytes + 8];
    for (i, value) in fields.iter().enumerate() {
        LittleEndian::write_i32(&mut buf[i * 4..(i + 1) * 4], *value as i32);
    }
    LittleEndian::write_f64_into(&result.tile, &mut buf[20..20 + tile_bytes]);
    LittleEndian::write_f64(&mut buf[20 + tile_bytes..], result.execution_time_ms);
    buf
}

/// Deserialize a result payload; the tile length must match the echoed bounds
pub fn deserialize_result(data: &[u8]) -> Result<TileResult, Error> {
    if data.len() < 28 {
        return Err(Error::Malformed(format!(
            "result payload is {} bytes, need at least 28",
            data.len()
        )));
    }
    let mut fields = [0usize; 5];
    for (i, field) in fields.iter_mut().enumerate() {
        let value = LittleEndian::read_i32(&data[i * 4..(i + 1) * 4]);
        if value < 0 {
            return Err(Error::Malformed(format!("result field {} is negative", i)));
        }
        *field = value as usize;
    }
    let [task_id, start_row, end_row, start_col, end_col] = fields;
    if end_row < start_row || end_col < start_col {
        return Err(Error::Malformed(format!(
            "result for task {} has inverted bounds",
            task_id
        )));
    }
    let tile_len = (end_row - start_row) * (end_col - start_col);
    let expected = 20 + tile_len * 8 + 8;
    if data.len() != expected {
        return Err(Error::Malformed(format!(
            "result payload is {} bytes, expected {} for a {}x{} tile",
            data.len(),
            expected,
            end_row - start_row,
            end_col - start_col
        )));
    }
    let mut tile = vec![0.0f64; tile_len];
    LittleEndian::read_f64_into(&data[20..20 + tile_len * 8], &mut tile);
    let execution_time_ms = LittleEndian::read_f64(&data[20 + tile_len * 8..]);
    Ok(TileResult {
        task_id,
        start_row,
        end_row,
        start_col,
        end_col,
        tile,
        execution_time_ms,
    })
}

/// Serialize a CPU speed advertisement (GHz)
pub fn serialize_cpu_info(cpu_ghz: f64) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    LittleEndian::write_f64(&mut buf, cpu_ghz);
    buf
}

/// Deserialize a CPU speed advertisement
pub fn deserialize_cpu_info(data: &[u8]) -> Result<f64, Error> {
    if data.len() != 8 {
        return Err(Error::Malformed(format!(
            "cpu info payload is {} bytes, expected 8",
            data.len()
        )));
    }
    Ok(LittleEndian::read_f64(data))
}

/// Frame a payload with the message header
pub fn encode_message(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];
    LittleEndian::write_u32(&mut buf[0..4], msg_type as u32);
    LittleEndian::write_u64(&mut buf[4..12], payload.len() as u64);
    buf[HEADER_LEN..].copy_from_slice(payload);
    buf
}

/// Split a framed message back into its type and payload
pub fn decode_message(buf: &[u8]) -> Result<(MessageType, Vec<u8>), Error> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Malformed(format!(
            "message is {} bytes, need at least {}",
            buf.len(),
            HEADER_LEN
        )));
    }
    let raw_type = LittleEndian::read_u32(&buf[0..4]);
    let msg_type = MessageType::from_u32(raw_type)
        .ok_or_else(|| Error::Malformed(format!("unknown message type {}", raw_type)))?;
    let payload_len = LittleEndian::read_u64(&buf[4..12]);
    if payload_len != (buf.len() - HEADER_LEN) as u64 {
        return Err(Error::Malformed(format!(
            "declared payload length {} does not match {} message bytes",
            payload_len,
            buf.len() - HEADER_LEN
        )));
    }
    Ok((msg_type, buf[HEADER_LEN..].to_vec()))
}

/// Write one framed message; short writes are retried by `write_all`.
pub fn send_message<W: Write>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<(), Error> {
    writer.write_all(&encode_message(msg_type, payload))?;
    Ok(())
}

/// Read one framed message. Any read failure, unknown message type, or absurd
/// declared length yields the `ClientDisconnect` sentinel; callers treat that
/// as end-of-stream.
pub fn receive_message<R: Read>(reader: &mut R) -> (MessageType, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    if reader.read_exact(&mut header).is_err() {
        return (MessageType::ClientDisconnect, Vec::new());
    }
    let raw_type = LittleEndian::read_u32(&header[0..4]);
    let payload_len = LittleEndian::read_u64(&header[4..12]);
    let msg_type = match MessageType::from_u32(raw_type) {
        Some(msg_type) => msg_type,
        None => return (MessageType::ClientDisconnect, Vec::new()),
    };
    if payload_len > MAX_PAYLOAD_LEN {
        return (MessageType::ClientDisconnect, Vec::new());
    }
    let mut payload = vec![0u8; payload_len as usize];
    if reader.read_exact(&mut payload).is_err() {
        return (MessageType::ClientDisconnect, Vec::new());
    }
    (msg_type, payload)
}
