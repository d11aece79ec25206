use std::io;
use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rand::Rng;

use tilemul::{Coordinator, Matrix};

#[derive(Parser)]
#[command(name = "coord", about = "Distributed matrix multiplication master")]
struct Args {
    /// TCP port to listen on
    port: u16,

    /// Edge length of the randomly generated square matrices
    #[arg(default_value_t = 1000)]
    matrix_size: usize,
}

fn generate_random_matrix(rows: usize, cols: usize) -> Matrix {
    let mut rng = rand::thread_rng();
    let mut matrix = Matrix::new(rows, cols);
    for value in matrix.data.iter_mut() {
        *value = rng.gen_range(0.0..1.0);
    }
    matrix
}

fn wait_for_enter() {
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    let mut master = Coordinator::new(args.port);
    if let Err(e) = master.start() {
        eprintln!("Failed to start master: {}", e);
        process::exit(1);
    }

    println!(
        "Generating random matrices of size {}x{}",
        args.matrix_size, args.matrix_size
    );
    let matrix_a = generate_random_matrix(args.matrix_size, args.matrix_size);
    let matrix_b = generate_random_matrix(args.matrix_size, args.matrix_size);

    if let Err(e) = master.set_matrices(matrix_a, matrix_b) {
        eprintln!("Failed to install matrices: {}", e);
        process::exit(1);
    }

    println!("\nWaiting for clients to connect...");
    println!("Press Enter when ready to start computation with the connected clients");
    wait_for_enter();

    if let Err(e) = master.start_computation() {
        eprintln!("Cannot start computation: {}", e);
        process::exit(1);
    }

    println!("Computation started. Waiting for completion...");
    while !master.is_complete() {
        thread::sleep(Duration::from_secs(1));
    }
    println!("Computation completed successfully!");

    // Display results (for small matrices only)
    if args.matrix_size <= 10 {
        let result = master.get_result();
        println!("\nResult Matrix ({}x{}):", result.rows, result.cols);
        for i in 0..result.rows {
            let mut line = String::new();
            for j in 0..result.cols {
                line.push_str(&format!("{:.4} ", result.data[i * result.cols + j]));
            }
            println!("{}", line.trim_end());
        }
    }

    println!("\nPress Enter to shutdown the server...");
    wait_for_enter();
    master.stop();
}
