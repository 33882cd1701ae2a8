use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "ipd",
    version,
    about = "Build scheduler, project registry, and admin API"
)]
struct Cli {
    /// Path to the ipd configuration file.
    #[arg(short, long, default_value = "ipd.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ipd_core::config::IpdConfig::from_file(&cli.config)?;
    ipd_core::logging::init(config.log.filter.as_deref());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(ipd_scheduler::serve(config))
}
