//! A worker process for the process-pool engine, serving the echo model.
//!
//! Speaks the process channel protocol on stdin and stdout and logs to stderr.
//! Set `RUST_LOG` to control verbosity.

use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use robata::engine::EchoEngine;
use robata::process::{run_worker, ModelLoader, WorkerEndpoint, WorkerOptions};
use robata::EngineError;

#[derive(Debug, Parser)]
#[command(name = "robata-worker", version, about)]
struct Args {
    /// Accelerator index the model is pinned to
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Acknowledge on stdout once the model is loaded
    #[arg(long)]
    signal_ready: bool,

    /// Answer every prompt with this text instead of echoing the prompt
    #[arg(long)]
    reply: Option<String>,

    /// Delay before each streamed character, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit after serving this many requests
    #[arg(long)]
    exit_after: Option<usize>,

    /// Fail to load the model, for testing startup failures
    #[arg(long, hide = true)]
    fail_load: bool,
}

struct EchoLoader {
    reply: Option<String>,
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl ModelLoader for EchoLoader {
    type Engine = EchoEngine;

    async fn load(self, device: usize) -> Result<EchoEngine, EngineError> {
        if self.fail {
            return Err(EngineError::Worker(format!("could not load model on device {device}")));
        }
        let engine = EchoEngine::new().with_delay(self.delay);
        Ok(match self.reply {
            Some(reply) => engine.with_reply(reply),
            None => engine,
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let loader = EchoLoader {
        reply: args.reply,
        delay: Duration::from_millis(args.delay_ms),
        fail: args.fail_load,
    };
    let options = WorkerOptions::new(args.device)
        .with_signal_ready(args.signal_ready)
        .with_max_requests(args.exit_after);

    match run_worker(loader, options, WorkerEndpoint::stdio()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(device = args.device, error = %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}
