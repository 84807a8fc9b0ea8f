//! Line-oriented control-plane server.
//!
//! One request per connection: read a line, dispatch, answer, close.
//! Handlers run concurrently on their own tasks; the assigner and the
//! janitor are spawned next to the accept loop. No failure inside a handler
//! ever escapes as anything but a one-line reply.

use crate::config::DispatcherConfig;
use crate::dispatcher::assigner::run_assigner;
use crate::dispatcher::janitor::run_janitor;
use crate::dispatcher::protocol::{Command, Reply};
use crate::dispatcher::results;
use crate::dispatcher::state::Scheduler;
use crate::logging::ci_log;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Binds the control socket and serves until SIGINT.
pub async fn run_dispatcher(host: &str, port: u16, config: DispatcherConfig) -> Result<()> {
    let results_dir = config.results_dir.clone();
    let (sched, queue_rx) = Scheduler::new(config)?;

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;
    ci_log(
        &results_dir,
        "dispatcher",
        &format!("listening on {}:{}", host, port),
    );

    serve(listener, sched, queue_rx).await
}

/// Accept loop plus background tasks. Split from [`run_dispatcher`] so tests
/// can bind port 0 themselves and learn the assigned address.
pub async fn serve(
    listener: TcpListener,
    sched: Arc<Scheduler>,
    queue_rx: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let results_dir = sched.config().results_dir.clone();

    tokio::spawn(run_assigner(sched.clone(), queue_rx));
    tokio::spawn(run_janitor(sched.clone()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let sched = sched.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, &sched).await;
                        });
                    }
                    Err(err) => {
                        ci_log(&results_dir, "dispatcher", &format!("accept failed: {}", err));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                ci_log(&results_dir, "dispatcher", "interrupt received, shutting down");
                return Ok(());
            }
        }
    }
}

/// Reads the request line, answers it, lets the connection drop.
async fn handle_connection(stream: TcpStream, sched: &Scheduler) {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();

    let mut line = String::new();
    if BufReader::new(reader).read_line(&mut line).await.is_err() {
        return;
    }

    let reply = handle_line(&line, sched).await;
    if writer
        .write_all(format!("{}\n", reply).as_bytes())
        .await
        .is_err()
    {
        tracing::debug!(?peer, "client went away before the reply");
    }
}

/// Executes one request line and produces the reply.
pub(crate) async fn handle_line(line: &str, sched: &Scheduler) -> Reply {
    match Command::parse(line) {
        None => Reply::Err,
        Some(Command::Status) => {
            let (runners, pending, assigned) = sched.counts().await;
            Reply::Status {
                runners,
                pending,
                assigned,
            }
        }
        Some(Command::Register(key)) => {
            sched.register(key).await;
            Reply::Registered
        }
        Some(Command::Heartbeat(key)) => {
            sched.heartbeat(&key).await;
            Reply::Alive
        }
        Some(Command::Dispatch { revision }) => {
            sched.dispatch(&revision).await;
            Reply::Queued
        }
        Some(Command::Result {
            revision,
            status,
            seconds,
        }) => {
            let timeline = sched.complete(&revision, &status).await;
            let results_dir = &sched.config().results_dir;
            if let Err(err) =
                results::write_result_file(results_dir, &revision, &status, &seconds, &timeline)
            {
                // the runner did its job; a bad disk must not look like a
                // protocol failure
                ci_log(
                    results_dir,
                    "dispatcher",
                    &format!("failed to write result for {}: {:#}", revision, err),
                );
            }
            Reply::Ack
        }
    }
}
