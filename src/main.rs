mod cli;
mod config;
mod dispatcher;
mod events;
mod logging;
mod net;
mod observer;
mod runner;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use config::DispatcherConfig;
use std::time::Duration;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    let result = runtime.block_on(async_main());

    // don't wait for in-flight handlers or a slow test command
    runtime.shutdown_timeout(Duration::from_millis(100));

    result
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    if cli.runner {
        return runner::run_runner(
            &cli.host,
            cli.port,
            &cli.dispatcher,
            &cli.test_cmd,
            &cli.results_dir,
        )
        .await;
    }

    if cli.observer {
        let repo = match cli.repo.as_deref() {
            Some(repo) => repo,
            None => anyhow::bail!("--observer requires --repo <path>"),
        };
        return observer::run_observer(
            repo,
            &cli.rev,
            Duration::from_secs(cli.poll_secs),
            &cli.dispatcher,
            &cli.results_dir,
        )
        .await;
    }

    let config = DispatcherConfig {
        results_dir: cli.results_dir.clone(),
        ..DispatcherConfig::from_env()
    };
    dispatcher::run_dispatcher(&cli.host, cli.port, config).await
}
