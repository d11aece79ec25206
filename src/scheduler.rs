//! Tile generation and the admission policy that balances work across
//! clients of unequal speed.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::Error;
use crate::protocol::Task;

/// Output tiles are at most this many rows and columns.
pub const TILE_SIZE: usize = 64;

/// Exponential smoothing factor for the per-client throughput estimate.
pub const SMOOTHING_ALPHA: f64 = 0.3;

/// Partition an `rows x cols` output into tiles, one task per tile, ids
/// assigned row-major starting at 0. `inner` is the shared dimension every
/// task carries.
pub fn tile_tasks(rows: usize, cols: usize, inner: usize) -> Vec<Task> {
    let row_tiles = (rows + TILE_SIZE - 1) / TILE_SIZE;
    let col_tiles = (cols + TILE_SIZE - 1) / TILE_SIZE;

    let mut tasks = Vec::with_capacity(row_tiles * col_tiles);
    let mut next_task_id = 0;

    for i in 0..row_tiles {
        let start_row = i * TILE_SIZE;
        let end_row = (start_row + TILE_SIZE).min(rows);

        for j in 0..col_tiles {
            let start_col = j * TILE_SIZE;
            let end_col = (start_col + TILE_SIZE).min(cols);

            tasks.push(Task {
                task_id: next_task_id,
                start_row,
                end_row,
                start_col,
                end_col,
                matrix_size: inner,
            });
            next_task_id += 1;
        }
    }

    tasks
}

/// What the master knows about one client's speed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCapability {
    /// Declared at handshake, floored at 0.0.
    pub cpu_ghz: f64,
    /// Turnaround of the most recent tile, 0 until the first result.
    pub last_task_ms: f64,
    /// Smoothed tasks-per-second estimate; seeded by the declared CPU speed.
    pub perf_ratio: f64,
}

/// Per-client capability table, keyed by client id.
#[derive(Debug, Default)]
pub struct PerfTable {
    entries: HashMap<u64, WorkerCapability>,
}

impl PerfTable {
    /// Register a client with its declared CPU speed
    pub fn register(&mut self, client: u64, cpu_ghz: f64) {
        let cpu_ghz = cpu_ghz.max(0.0);
        self.entries.insert(
            client,
            WorkerCapability {
                cpu_ghz,
                last_task_ms: 0.0,
                perf_ratio: cpu_ghz,
            },
        );
    }

    /// Drop a client's entry (it disconnected)
    pub fn remove(&mut self, client: u64) {
        self.entries.remove(&client);
    }

    /// Blend a completed tile's turnaround into the throughput estimate.
    /// Non-positive times are ignored.
    pub fn record(&mut self, client: u64, task_ms: f64) {
        let info = self.entries.entry(client).or_default();
        info.last_task_ms = task_ms;
        if task_ms > 0.0 {
            let new_ratio = 1000.0 / task_ms;
            info.perf_ratio =
                (1.0 - SMOOTHING_ALPHA) * info.perf_ratio + SMOOTHING_ALPHA * new_ratio;
        }
        debug!(
            "Client {} performance ratio updated to: {}",
            client, info.perf_ratio
        );
    }

    /// The client's throughput estimate; unknown or non-positive reads as 1.0
    pub fn ratio(&self, client: u64) -> f64 {
        match self.entries.get(&client) {
            Some(info) if info.perf_ratio > 0.0 => info.perf_ratio,
            _ => 1.0,
        }
    }

    pub fn get(&self, client: u64) -> Option<WorkerCapability> {
        self.entries.get(&client).copied()
    }
}

/// The pending-task queue plus the per-client accounting the admission
/// policy reads. Everything here is guarded by one mutex on the master.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: VecDeque<Task>,
    in_flight: HashMap<u64, usize>,
    committed: HashSet<usize>,
}

impl WorkQueue {
    /// Replace the queue with a fresh task set and reset the accounting
    pub fn load(&mut self, tasks: Vec<Task>) {
        self.queue = tasks.into();
        self.committed.clear();
        for count in self.in_flight.values_mut() {
            *count = 0;
        }
    }

    /// Start tracking a client with zero tiles in flight
    pub fn register_client(&mut self, client: u64) {
        self.in_flight.entry(client).or_insert(0);
    }

    /// Number of tasks still queued
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of clients the queue is tracking
    pub fn client_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Tiles currently assigned to a client and not yet returned
    pub fn in_flight(&self, client: u64) -> usize {
        self.in_flight.get(&client).copied().unwrap_or(0)
    }

    /// Pop the head task for `client` unless the fairness filter defers it.
    ///
    /// With more than one client tracked, the client is deferred when some
    /// peer has a strictly smaller weighted load (tiles in flight divided by
    /// throughput) and the queue is no longer than the client count. That
    /// keeps a fast client from draining the tail of the queue while slower
    /// peers sit idle.
    pub fn try_assign(&mut self, client: u64, perf: &PerfTable) -> Option<Task> {
        if self.queue.is_empty() {
            return None;
        }

        if self.in_flight.len() > 1 && self.queue.len() <= self.in_flight.len() {
            let my_count = self.in_flight(client);
            let my_weighted = my_count as f64 / perf.ratio(client);

            for (&other, &other_count) in &self.in_flight {
                if other == client {
                    continue;
                }
                let other_weighted = other_count as f64 / perf.ratio(other);
                if my_weighted > other_weighted {
                    return None;
                }
            }
        }

        let task = self.queue.pop_front()?;
        *self.in_flight.entry(client).or_insert(0) += 1;
        Some(task)
    }

    /// Account for a returned tile. Each task id may be committed once; a
    /// repeat is a protocol fault on the reporting session.
    pub fn mark_committed(&mut self, client: u64, task_id: usize) -> Result<(), Error> {
        if let Some(count) = self.in_flight.get_mut(&client) {
            *count = count.saturating_sub(1);
        }
        if !self.committed.insert(task_id) {
            return Err(Error::DuplicateResult(task_id));
        }
        Ok(())
    }
}
