//! The worker: dials the master, advertises its CPU speed, receives both
//! input matrices, then loops pulling tiles and returning computed results.

use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Error;
use crate::kernel;
use crate::matrix::Matrix;
use crate::protocol::{self, MessageType, Task, TileResult};

/// How long to sleep after a NO_WORK reply before asking again.
pub const NO_WORK_BACKOFF: Duration = Duration::from_millis(200);

pub struct Worker {
    stream: TcpStream,
    matrix_a: Matrix,
    matrix_b: Matrix,
}

impl Worker {
    /// Dial the master and run the handshake: send the CPU speed, then
    /// receive matrices A and B in that order.
    pub fn connect(addr: &str) -> Result<Self, Error> {
        let mut stream = TcpStream::connect(addr)?;
        info!("Connected to master at {}", addr);

        let cpu_ghz = detect_cpu_ghz();
        protocol::send_message(
            &mut stream,
            MessageType::CpuInfo,
            &protocol::serialize_cpu_info(cpu_ghz),
        )?;
        info!("Reported CPU speed: {:.2} GHz", cpu_ghz);

        let matrix_a = receive_matrix(&mut stream)?;
        let matrix_b = receive_matrix(&mut stream)?;
        info!(
            "Received matrices: A({}x{}), B({}x{})",
            matrix_a.rows, matrix_a.cols, matrix_b.rows, matrix_b.cols
        );

        Ok(Worker {
            stream,
            matrix_a,
            matrix_b,
        })
    }

    /// Drive the request/compute/reply loop until the master ends the
    /// session or the connection drops.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            protocol::send_message(&mut self.stream, MessageType::TaskRequest, &[])?;

            let (msg_type, payload) = protocol::receive_message(&mut self.stream);
            match msg_type {
                MessageType::TaskResponse => {
                    let task = protocol::deserialize_task(&payload)?;
                    info!(
                        "Received task {} (rows {} to {}, cols {} to {})",
                        task.task_id, task.start_row, task.end_row, task.start_col, task.end_col
                    );

                    let result = self.compute(&task)?;
                    let result_payload = protocol::serialize_result(&result);
                    protocol::send_message(
                        &mut self.stream,
                        MessageType::ComputationResult,
                        &result_payload,
                    )?;
                }
                MessageType::NoWork => {
                    // Nothing to do yet; retry after a short pause.
                    thread::sleep(NO_WORK_BACKOFF);
                }
                MessageType::Shutdown | MessageType::ClientDisconnect => {
                    info!("Received shutdown from master");
                    break;
                }
                other => {
                    return Err(Error::UnexpectedMessage {
                        expected: "task response",
                        got: other,
                    });
                }
            }
        }
        Ok(())
    }

    fn compute(&self, task: &Task) -> Result<TileResult, Error> {
        if task.start_row >= task.end_row
            || task.start_col >= task.end_col
            || task.end_row > self.matrix_a.rows
            || task.end_col > self.matrix_b.cols
            || task.matrix_size != self.matrix_a.cols
        {
            return Err(Error::TaskOutOfRange {
                task_id: task.task_id,
            });
        }

        let kernel_start = Instant::now();
        let tile = kernel::multiply_range(
            &self.matrix_a,
            &self.matrix_b,
            task.start_row,
            task.end_row,
            task.start_col,
            task.end_col,
        );
        let execution_time_ms = kernel_start.elapsed().as_secs_f64() * 1000.0;

        Ok(TileResult {
            task_id: task.task_id,
            start_row: task.start_row,
            end_row: task.end_row,
            start_col: task.start_col,
            end_col: task.end_col,
            tile,
            execution_time_ms,
        })
    }
}

fn receive_matrix(stream: &mut TcpStream) -> Result<Matrix, Error> {
    let (msg_type, payload) = protocol::receive_message(stream);
    match msg_type {
        MessageType::MatrixData => protocol::deserialize_matrix(&payload),
        MessageType::ClientDisconnect => Err(Error::Disconnected),
        other => Err(Error::UnexpectedMessage {
            expected: "matrix data",
            got: other,
        }),
    }
}

/// Estimate the CPU clock speed in GHz by timing a dependent multiply-add
/// loop. The estimate only seeds the master's scheduling prior, so a coarse
/// figure is fine.
pub fn detect_cpu_ghz() -> f64 {
    const OPS: u64 = 20_000_000;

    let mut x = 1.000_000_1_f64;
    let timer = Instant::now();
    for _ in 0..OPS {
        x = x * 1.000_000_01 + 1e-12;
    }
    let elapsed = timer.elapsed().as_secs_f64();
    std::hint::black_box(x);

    if elapsed > 0.0 {
        (OPS as f64 / elapsed / 1e9).max(0.1)
    } else {
        1.0
    }
}
