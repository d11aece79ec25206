use std::process;

use clap::Parser;
use tracing::error;

use tilemul::Worker;

#[derive(Parser)]
#[command(name = "worker", about = "Distributed matrix multiplication worker")]
struct Args {
    /// Address of the master server
    master_ip: String,

    /// Port of the master server
    master_port: u16,
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

    let addr = format!("{}:{}", args.master_ip, args.master_port);
    let mut worker = match Worker::connect(&addr) {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("Failed to connect to master server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = worker.run() {
        error!("Worker session ended with error: {}", e);
    }
    println!("Client disconnected");
}
