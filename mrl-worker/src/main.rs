use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mrl_worker::args::Args;
use mrl_worker::{NodeConfig, NodeController, NodeHandle, NodeStatus};

/// Forward `step` and `stop` lines from stdin to the node.
async fn read_commands(handle: &NodeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "step" | "s" => {
                    if handle.step().is_err() {
                        return;
                    }
                }
                "stop" | "q" => {
                    let _ = handle.stop();
                    return;
                }
                "" => {}
                other => warn!("unknown command `{other}`, expected `step` or `stop`"),
            },
            Ok(None) => return,
            Err(e) => {
                error!("failed to read stdin: {e}");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::from_args(&args)?;
    info!("Joining master at {}", config.master);

    let handle = NodeController::new(config).spawn();
    let mut status = handle.subscribe();

    let stdin = async {
        if args.interactive {
            read_commands(&handle).await;
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Worker exiting..."),
                Err(err) => error!("Unable to listen for shutdown signal: {err}"),
            }
            let _ = handle.stop();
        }
        _ = status.wait_for(NodeStatus::is_terminal) => {}
        _ = stdin => {}
    }

    match handle.join().await {
        NodeStatus::Error(reason) => Err(format!("worker failed: {reason}").into()),
        status => {
            info!("Worker {status}");
            Ok(())
        }
    }
}
