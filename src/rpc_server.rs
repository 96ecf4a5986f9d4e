//! marksync RPC server: JSON-RPC over stdin/stdout for a UI shell.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! Request:  {"id":1, "method":"bookmark.add", "params":{"session":"...","url":"...","title":"..."}}
//! Response: {"id":1, "result":{...}} or {"id":1, "error":{"kind":"...",...}}
//! Push:     {"event":"bookmarks.changed", "session":"...", "bookmarks":[...], ...}
//!
//! Logs go to stderr; stdout carries nothing but protocol lines. Bookmark
//! calls run in their own tasks, so their responses may come back out of
//! request order; match them by `id`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marksync::app::App;
use marksync::rpc_handler::RpcContext;
use marksync::services::settings_engine::{SettingsEngine, SettingsEngineTrait};

/// Environment variable holding the log filter.
const ENV_LOG: &str = "MARKSYNC_LOG";

/// Simple rate limiter: max requests per second.
struct RateLimiter {
    window_start: Instant,
    request_count: u32,
    max_per_second: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self { window_start: Instant::now(), request_count: 0, max_per_second }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    fn check(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 1 {
            self.window_start = Instant::now();
            self.request_count = 0;
        }
        self.request_count += 1;
        self.request_count <= self.max_per_second
    }
}

fn setup_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn respond(ctx: &RpcContext, id: Value, method: &str, params: &Value) -> Value {
    match ctx.handle_method(method, params).await {
        Ok(val) => json!({"id": id, "result": val}),
        Err(err) => json!({"id": id, "error": err.to_value()}),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = SettingsEngine::new(None);
    let loaded = settings.load();
    settings.apply_env_overrides();
    setup_tracing(&settings.get_settings().logging.filter);
    if let Err(e) = loaded {
        warn!(error = %e, "could not load settings; using defaults");
    }

    let app = App::new(settings)?;
    let (ctx, mut pushes) = RpcContext::new(app);
    let ctx = Arc::new(ctx);

    // Single writer so responses and pushes never interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(message) = out_rx.recv().await {
            let line = format!("{}\n", message);
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });
    let push_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(push) = pushes.recv().await {
            if push_tx.send(push).is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(json!({"event": "ready", "version": env!("CARGO_PKG_VERSION")}));
    info!("rpc server ready");

    // Max 200 RPC requests per second.
    let mut rate_limiter = RateLimiter::new(200);

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        while calls.try_join_next().is_some() {}

        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let _ = out_tx.send(json!({"id": null, "error": {"kind": "bad_request", "message": format!("parse error: {}", e)}}));
                continue;
            }
        };

        let id = req.get("id").cloned().unwrap_or(Value::Null);

        if !rate_limiter.check() {
            let _ = out_tx.send(json!({"id": id, "error": {"kind": "bad_request", "message": "rate limit exceeded"}}));
            continue;
        }

        let method = req.get("method").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let params = req.get("params").cloned().unwrap_or(json!({}));

        if RpcContext::runs_concurrently(&method) {
            let ctx = ctx.clone();
            let out_tx = out_tx.clone();
            calls.spawn(async move {
                let _ = out_tx.send(respond(&ctx, id, &method, &params).await);
            });
        } else {
            let _ = out_tx.send(respond(&ctx, id, &method, &params).await);
        }
    }

    info!(in_flight = calls.len(), "stdin closed; shutting down");
    while calls.join_next().await.is_some() {}
    ctx.close_all().await;
    forwarder.abort();
    let _ = forwarder.await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
