use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mini-ci")]
#[command(about = "Distributed CI: revision dispatcher, test runners, repo observer")]
#[command(version)]
pub struct Cli {
    /// Address the dispatcher listens on (the runner's own address in --runner mode)
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port the dispatcher listens on (the runner's own port in --runner mode)
    #[arg(long, default_value = "8888")]
    pub port: u16,

    /// Run as a test runner instead of the dispatcher
    #[arg(long)]
    pub runner: bool,

    /// Run as a repository observer instead of the dispatcher
    #[arg(long)]
    pub observer: bool,

    /// Dispatcher address for --runner and --observer modes
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub dispatcher: String,

    /// Git working copy watched in --observer mode
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Git ref resolved on every poll in --observer mode
    #[arg(long, default_value = "origin/HEAD")]
    pub rev: String,

    /// Poll interval in seconds for --observer mode
    #[arg(long, default_value = "5")]
    pub poll_secs: u64,

    /// Shell command executed per revision in --runner mode
    #[arg(long, default_value = "echo tests passed")]
    pub test_cmd: String,

    /// Directory for result files, the shared log and the event journal
    #[arg(long, default_value = "test_results")]
    pub results_dir: PathBuf,
}
