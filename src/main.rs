use clap::Parser;
use log::error;
use serde_json::json;

use gleiswerk::cli::{self, Cli};
use gleiswerk::errors::GleisError;

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Logs go to stderr; stdout carries exactly one JSON envelope.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("gleiswerk=info"),
    )
    .format_timestamp_millis()
    .try_init();

    if which::which("git").is_err() {
        print_failure(&json!({
            "type": "GitOperationFailed",
            "data": { "operation": "startup", "message": "git binary not found on PATH" },
        }));
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli::run(cli).await {
        Ok(result) => {
            println!("{}", json!({ "success": true, "result": result }));
        }
        Err(e) => {
            error!("{e:#}");
            let payload = match e.downcast_ref::<GleisError>() {
                Some(known) => serde_json::to_value(known).unwrap_or_else(|_| {
                    json!({ "type": "Internal", "data": { "message": known.to_string() } })
                }),
                None => json!({ "type": "Internal", "data": { "message": format!("{e:#}") } }),
            };
            print_failure(&payload);
            std::process::exit(1);
        }
    }
}

fn print_failure(error: &serde_json::Value) {
    println!("{}", json!({ "success": false, "error": error }));
}
