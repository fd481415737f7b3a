use anyhow::Result;
use clap::Parser;
use interview_rtc::Config;

use example::init_logger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// address to listen on. overrides INTERVIEW_LISTEN_ADDR
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger(log::LevelFilter::Debug);
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(addr) = cli.addr {
        config.listen_addr = addr;
    }

    tokio::select! {
        res = interview_rtc::server::serve(config) => res?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
    }
    Ok(())
}
