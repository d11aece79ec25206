use std::io;

use thiserror::Error;

use crate::protocol::MessageType;

/// Errors surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("matrix dimensions incompatible: {a_rows}x{a_cols} * {b_rows}x{b_cols}")]
    DimensionMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    #[error("index out of bounds: ({row}, {col}) for matrix {rows}x{cols}")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("data length {len} does not match dimensions {rows}x{cols}")]
    DataShape {
        len: usize,
        rows: usize,
        cols: usize,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("expected {expected}, got {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: MessageType,
    },

    #[error("task {task_id} out of range for received matrices")]
    TaskOutOfRange { task_id: usize },

    #[error("duplicate result for task {0}")]
    DuplicateResult(usize),

    #[error("no clients connected")]
    NoClients,

    #[error("computation already started")]
    AlreadyStarted,

    #[error("connection closed by peer")]
    Disconnected,
}
