//! The master: accepts worker connections, hands out tiles, and stitches
//! returned tiles into the result matrix.
//!
//! One acceptor thread blocks in `accept`; each connection gets its own
//! handler thread. Handlers share state through three locks (work queue,
//! performance table, client registry) plus atomic flags and counters.
//! Lock order is work queue before performance table; the registry lock is
//! never held across either.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::Error;
use crate::matrix::Matrix;
use crate::protocol::{self, MessageType, TileResult};
use crate::scheduler::{tile_tasks, PerfTable, WorkQueue};

struct ClientHandle {
    stream: TcpStream,
    thread: Option<JoinHandle<()>>,
}

struct MatrixStore {
    a: Matrix,
    b: Matrix,
    c: Matrix,
}

struct Shared {
    running: AtomicBool,
    started: AtomicBool,
    total_tasks: AtomicUsize,
    completed_tasks: AtomicUsize,
    next_client_id: AtomicU64,
    work: Mutex<WorkQueue>,
    work_cv: Condvar,
    perf: Mutex<PerfTable>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    matrices: Mutex<MatrixStore>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn is_complete(&self) -> bool {
        let total = self.total_tasks.load(Ordering::Acquire);
        self.started.load(Ordering::Acquire)
            && total > 0
            && self.completed_tasks.load(Ordering::Acquire) >= total
    }
}

/// The coordinator process: owns A, B, C, the task queue, and every
/// scheduling decision.
pub struct Coordinator {
    shared: Arc<Shared>,
    accept_handle: Option<JoinHandle<()>>,
    port: u16,
}

impl Coordinator {
    /// Create a master that will listen on `port` (0 picks an ephemeral port)
    pub fn new(port: u16) -> Self {
        Coordinator {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                total_tasks: AtomicUsize::new(0),
                completed_tasks: AtomicUsize::new(0),
                next_client_id: AtomicU64::new(0),
                work: Mutex::new(WorkQueue::default()),
                work_cv: Condvar::new(),
                perf: Mutex::new(PerfTable::default()),
                clients: Mutex::new(HashMap::new()),
                matrices: Mutex::new(MatrixStore {
                    a: Matrix::new(1, 1),
                    b: Matrix::new(1, 1),
                    c: Matrix::new(1, 1),
                }),
                listen_addr: Mutex::new(None),
            }),
            accept_handle: None,
            port,
        }
    }

    /// Bind the listening socket and begin accepting clients
    pub fn start(&mut self) -> Result<(), Error> {
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Error creating listening socket: {}", e);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        *self.shared.listen_addr.lock().unwrap() = Some(addr);
        self.shared.running.store(true, Ordering::SeqCst);

        info!("Master server started on port {}", addr.port());
        info!("Waiting for clients to connect...");

        let shared = Arc::clone(&self.shared);
        self.accept_handle = Some(thread::spawn(move || accept_loop(&shared, listener)));
        Ok(())
    }

    /// The bound listen address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.listen_addr.lock().unwrap()
    }

    /// Install the input matrices, allocate the result, and generate the
    /// tile task set. A dimension mismatch leaves prior state unchanged.
    pub fn set_matrices(&self, a: Matrix, b: Matrix) -> Result<(), Error> {
        if a.cols != b.rows {
            error!(
                "Invalid matrix dimensions for multiplication: A is {}x{}, B is {}x{}",
                a.rows, a.cols, b.rows, b.cols
            );
            return Err(Error::DimensionMismatch {
                a_rows: a.rows,
                a_cols: a.cols,
                b_rows: b.rows,
                b_cols: b.cols,
            });
        }

        let tasks = tile_tasks(a.rows, b.cols, a.cols);
        let total = tasks.len();

        {
            let mut matrices = self.shared.matrices.lock().unwrap();
            matrices.c = Matrix::new(a.rows, b.cols);
            matrices.a = a;
            matrices.b = b;
        }
        self.shared.work.lock().unwrap().load(tasks);
        self.shared.total_tasks.store(total, Ordering::Release);
        self.shared.completed_tasks.store(0, Ordering::Release);

        info!("Created {} tiled tasks", total);
        Ok(())
    }

    /// Latch the started flag and release handlers blocked on the task
    /// condition. Refuses when no clients are connected or when already
    /// started.
    pub fn start_computation(&self) -> Result<(), Error> {
        if self.shared.started.load(Ordering::SeqCst) {
            warn!("Computation already started");
            return Err(Error::AlreadyStarted);
        }

        let client_count = self.shared.clients.lock().unwrap().len();
        if client_count == 0 {
            error!("No clients connected. Cannot start computation.");
            return Err(Error::NoClients);
        }

        info!(
            "Starting computation with {} connected clients",
            client_count
        );
        // The flag must flip under the work lock: a handler that checked it
        // just before parking would otherwise miss this wakeup.
        {
            let _work = self.shared.work.lock().unwrap();
            self.shared.started.store(true, Ordering::SeqCst);
            self.shared.work_cv.notify_all();
        }
        Ok(())
    }

    /// True once every generated tile has been committed
    pub fn is_complete(&self) -> bool {
        self.shared.is_complete()
    }

    /// Clone of the result matrix
    pub fn get_result(&self) -> Matrix {
        self.shared.matrices.lock().unwrap().c.clone()
    }

    /// Number of currently registered clients
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    /// Stop accepting, shut every client session down, and join all threads
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Release handlers parked on the task condition; notify under the
        // work lock so none of them can slip between the flag check and the
        // wait.
        {
            let _work = self.shared.work.lock().unwrap();
            self.shared.work_cv.notify_all();
        }

        let handles: Vec<(u64, ClientHandle)> = {
            let mut clients = self.shared.clients.lock().unwrap();
            clients.drain().collect()
        };
        for (_, mut handle) in handles {
            let _ = protocol::send_message(&mut handle.stream, MessageType::Shutdown, &[]);
            let _ = handle.stream.shutdown(Shutdown::Both);
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }

        // A throwaway connection unblocks the acceptor so it can observe the
        // cleared running flag.
        if let Some(addr) = self.local_addr() {
            let wake = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port());
            let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(100));
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: &Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::SeqCst) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
                break;
            }
        };
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        info!("New client connected: {}", addr);
        let client_id = shared.next_client_id.fetch_add(1, Ordering::SeqCst);

        let handler_stream = stream;
        let registry_stream = match handler_stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                error!("Failed to clone client socket: {}", e);
                continue;
            }
        };

        let handler_shared = Arc::clone(shared);
        let thread =
            thread::spawn(move || handle_client(&handler_shared, handler_stream, client_id, addr));

        let mut clients = shared.clients.lock().unwrap();
        clients.insert(
            client_id,
            ClientHandle {
                stream: registry_stream,
                thread: Some(thread),
            },
        );
        info!("Connected clients: {}", clients.len());
    }
}

fn handle_client(shared: &Arc<Shared>, mut stream: TcpStream, client_id: u64, addr: SocketAddr) {
    // Handshake: the client leads with its CPU speed.
    let (msg_type, payload) = protocol::receive_message(&mut stream);
    match msg_type {
        MessageType::CpuInfo => match protocol::deserialize_cpu_info(&payload) {
            Ok(cpu_ghz) => {
                shared.perf.lock().unwrap().register(client_id, cpu_ghz);
                info!("Client {} reported CPU speed: {} GHz", addr, cpu_ghz);
            }
            Err(e) => warn!("Bad CPU info from {}: {}", addr, e),
        },
        MessageType::ClientDisconnect => {
            deregister_client(shared, client_id, &stream, addr);
            return;
        }
        other => warn!("Expected CPU info from {}, got {:?}", addr, other),
    }

    // Ship both input matrices, A first.
    let (payload_a, payload_b) = {
        let matrices = shared.matrices.lock().unwrap();
        (
            protocol::serialize_matrix(&matrices.a),
            protocol::serialize_matrix(&matrices.b),
        )
    };
    if protocol::send_message(&mut stream, MessageType::MatrixData, &payload_a).is_err()
        || protocol::send_message(&mut stream, MessageType::MatrixData, &payload_b).is_err()
    {
        error!("Failed to send matrices to {}", addr);
        deregister_client(shared, client_id, &stream, addr);
        return;
    }

    shared.work.lock().unwrap().register_client(client_id);

    while shared.running.load(Ordering::SeqCst) {
        let (msg_type, payload) = protocol::receive_message(&mut stream);

        match msg_type {
            MessageType::TaskRequest => {
                let mut work = shared.work.lock().unwrap();
                // Park until the computation starts or the master stops.
                while !shared.started.load(Ordering::SeqCst)
                    && shared.running.load(Ordering::SeqCst)
                {
                    work = shared.work_cv.wait(work).unwrap();
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }

                let assigned = {
                    let perf = shared.perf.lock().unwrap();
                    work.try_assign(client_id, &perf)
                };
                drop(work);

                match assigned {
                    Some(task) => {
                        let task_payload = protocol::serialize_task(&task);
                        if protocol::send_message(
                            &mut stream,
                            MessageType::TaskResponse,
                            &task_payload,
                        )
                        .is_err()
                        {
                            error!("Failed to send task {} to {}", task.task_id, addr);
                            break;
                        }
                        info!("Assigned task {} to client {}", task.task_id, addr);
                    }
                    None if shared.is_complete() => {
                        // Nothing left anywhere: release the client.
                        let _ = protocol::send_message(&mut stream, MessageType::Shutdown, &[]);
                        break;
                    }
                    None => {
                        if protocol::send_message(&mut stream, MessageType::NoWork, &[]).is_err() {
                            break;
                        }
                    }
                }
            }
            MessageType::ComputationResult => {
                let result = match protocol::deserialize_result(&payload) {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Malformed result from {}: {}", addr, e);
                        break;
                    }
                };
                shared
                    .perf
                    .lock()
                    .unwrap()
                    .record(client_id, result.execution_time_ms);
                if let Err(e) = commit_result(shared, client_id, &result) {
                    error!("Rejecting result from {}: {}", addr, e);
                    break;
                }
            }
            MessageType::ClientDisconnect => {
                info!("Client disconnected: {}", addr);
                break;
            }
            other => {
                warn!("Unexpected message {:?} from {}", other, addr);
                break;
            }
        }
    }

    deregister_client(shared, client_id, &stream, addr);
}

/// Copy a returned tile into the result matrix and advance the completion
/// counter. A duplicate task id or a tile that does not fit the result is a
/// protocol fault on the reporting session.
fn commit_result(shared: &Arc<Shared>, client_id: u64, result: &TileResult) -> Result<(), Error> {
    shared
        .work
        .lock()
        .unwrap()
        .mark_committed(client_id, result.task_id)?;

    {
        let mut matrices = shared.matrices.lock().unwrap();
        let c = &mut matrices.c;
        let tile_cols = result.end_col - result.start_col;
        let tile_rows = result.end_row - result.start_row;

        if result.end_row > c.rows
            || result.end_col > c.cols
            || result.tile.len() != tile_rows * tile_cols
        {
            return Err(Error::Malformed(format!(
                "tile for task {} does not fit the result matrix",
                result.task_id
            )));
        }

        for local_row in 0..tile_rows {
            let row = result.start_row + local_row;
            let src = &result.tile[local_row * tile_cols..(local_row + 1) * tile_cols];
            let dst_start = row * c.cols + result.start_col;
            c.data[dst_start..dst_start + tile_cols].copy_from_slice(src);
        }
    }

    let completed = shared.completed_tasks.fetch_add(1, Ordering::AcqRel) + 1;
    let total = shared.total_tasks.load(Ordering::Acquire);
    info!(
        "Completed task {} ({}/{})",
        result.task_id, completed, total
    );
    if shared.is_complete() {
        info!("Matrix multiplication complete!");
    }
    Ok(())
}

fn deregister_client(shared: &Arc<Shared>, client_id: u64, stream: &TcpStream, addr: SocketAddr) {
    let _ = stream.shutdown(Shutdown::Both);
    shared.perf.lock().unwrap().remove(client_id);
    let mut clients = shared.clients.lock().unwrap();
    // Dropping the handle detaches the thread; only stop() joins.
    clients.remove(&client_id);
    info!("Client {} removed, connected clients: {}", addr, clients.len());
}
