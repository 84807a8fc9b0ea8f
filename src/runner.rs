//! Test-runner process.
//!
//! Accepts `RUN <revision>` offers on its own listening socket, answers
//! `OK` immediately and executes the test command in the background so the
//! dispatcher is never blocked on a suite. A second offer while a suite is
//! running gets `BUSY`. Results are reported back over a fresh connection,
//! and a heartbeat task keeps the dispatcher convinced we are alive.

use crate::config::HEARTBEAT_INTERVAL_SECS;
use crate::logging::ci_log;
use crate::net::send_line;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Deadline for every exchange with the dispatcher.
const DISPATCHER_TIMEOUT: Duration = Duration::from_secs(3);

/// Binds the runner's socket and serves offers until the process dies.
pub async fn run_runner(
    host: &str,
    port: u16,
    dispatcher: &str,
    test_cmd: &str,
    results_dir: &Path,
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;
    serve_runner(
        listener,
        dispatcher.to_string(),
        test_cmd.to_string(),
        results_dir.to_path_buf(),
    )
    .await
}

/// Register, heartbeat, accept loop. Split from [`run_runner`] so tests can
/// bind port 0 themselves; the address announced to the dispatcher is read
/// back from the listener.
pub(crate) async fn serve_runner(
    listener: TcpListener,
    dispatcher: String,
    test_cmd: String,
    results_dir: PathBuf,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("runner listener has no local address")?;
    let host = addr.ip().to_string();
    let port = addr.port();

    // no dispatcher means no work will ever arrive; fail fast
    send_line(
        &dispatcher,
        &format!("REGISTER {} {}", host, port),
        DISPATCHER_TIMEOUT,
    )
    .await
    .with_context(|| format!("failed to register with dispatcher at {}", dispatcher))?;
    ci_log(
        &results_dir,
        "runner",
        &format!("registered {}:{} with dispatcher {}", host, port, dispatcher),
    );

    let busy = Arc::new(AtomicBool::new(false));
    spawn_heartbeat(host, port, dispatcher.clone(), results_dir.clone());

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                ci_log(&results_dir, "runner", &format!("accept failed: {}", err));
                continue;
            }
        };

        let busy = busy.clone();
        let dispatcher = dispatcher.clone();
        let test_cmd = test_cmd.clone();
        let results_dir = results_dir.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            if BufReader::new(reader).read_line(&mut line).await.is_err() {
                return;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let reply = match fields.as_slice() {
                [command, revision] if command.eq_ignore_ascii_case("RUN") => {
                    if busy
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let revision = (*revision).to_string();
                        tokio::spawn(execute(revision, test_cmd, dispatcher, results_dir, busy));
                        "OK"
                    } else {
                        "BUSY"
                    }
                }
                _ => "ERR",
            };
            let _ = writer.write_all(format!("{}\n", reply).as_bytes()).await;
        });
    }
}

/// Heartbeats the dispatcher every [`HEARTBEAT_INTERVAL_SECS`]. Send
/// failures are logged and retried on the next tick.
fn spawn_heartbeat(host: String, port: u16, dispatcher: String, results_dir: PathBuf) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tick.tick().await;
            if let Err(err) = send_line(
                &dispatcher,
                &format!("HEARTBEAT {} {}", host, port),
                DISPATCHER_TIMEOUT,
            )
            .await
            {
                ci_log(
                    &results_dir,
                    "runner",
                    &format!("heartbeat failed: {:#}", err),
                );
            }
        }
    });
}

/// Runs the test command for one revision and reports the outcome.
async fn execute(
    revision: String,
    test_cmd: String,
    dispatcher: String,
    results_dir: PathBuf,
    busy: Arc<AtomicBool>,
) {
    ci_log(
        &results_dir,
        "runner",
        &format!("running tests for {}", revision),
    );
    let started = Instant::now();
    let status = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&test_cmd)
        .env("CI_REVISION", &revision)
        .output()
        .await
    {
        Ok(output) if output.status.success() => "OK",
        Ok(_) => "FAIL",
        Err(err) => {
            ci_log(
                &results_dir,
                "runner",
                &format!("test command failed to start: {}", err),
            );
            "FAIL"
        }
    };
    let seconds = started.elapsed().as_secs_f64();
    busy.store(false, Ordering::SeqCst);

    let report = format!("RESULT {} {} {:.3}", revision, status, seconds);
    match send_line(&dispatcher, &report, DISPATCHER_TIMEOUT).await {
        Ok(_) => ci_log(
            &results_dir,
            "runner",
            &format!("{} finished: {} in {:.3}s", revision, status, seconds),
        ),
        Err(err) => ci_log(
            &results_dir,
            "runner",
            &format!("failed to report result for {}: {:#}", revision, err),
        ),
    }
}
