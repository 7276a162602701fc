// Home Medic daemon entry point

use anyhow::Result;
use clap::Parser;
use home_medic::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    if let Err(e) = cli::commands::execute(cli.command).await {
        cli::error(&format!("{:#}", e));
        return Err(e);
    }
    Ok(())
}
