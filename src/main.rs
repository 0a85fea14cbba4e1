mod calc;
mod columns;
mod config;
mod db;
mod error;
mod grid;
mod ipc;
mod matcher;
mod store;
mod template;

use std::io::{self, BufRead, Write};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    dotenvy::dotenv().ok();
    let config = config::Config::from_env();

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| {
            EnvFilter::new(config::DEFAULT_LOG_FILTER)
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut state = ipc::AppState::default();
    if let Some(path) = &config.workspace {
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            error!(workspace = %path.display(), error = ?e, "startup workspace failed to open");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "examd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; answer with an empty one.
                let resp = ipc::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
