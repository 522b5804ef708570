use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use webhook_recorder::log::init_tracing;
use webhook_recorder::rpc::{parse_line, App};

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    init_tracing();

    let app = Arc::new(App::new());
    let loop_app = app.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let joined = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request = match parse_line(trimmed) {
                Ok(r) => r,
                Err(resp) => {
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";
            let response = handle.block_on(loop_app.handle(&request));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    })
    .await;

    if let Err(e) = joined {
        tracing::error!(error = %e, "protocol loop panicked");
    }
    // Host closed stdin without a shutdown call.
    app.shutdown().await;
}

fn emit_line(out: &mut impl Write, resp: &impl Serialize) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => tracing::error!(error = %e, "failed to encode response"),
    }
}
