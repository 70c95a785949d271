use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = forkmaster::fm::cli::Args::parse();
    forkmaster::fm::daemon::run_daemon_async(args).await
}
