use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novel2epub::logging::init().context("init logging")?;

    let cli = novel2epub::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        novel2epub::cli::Command::Download(args) => {
            novel2epub::download::run(args).await.context("download")?;
        }
        novel2epub::cli::Command::Serve(args) => {
            novel2epub::server::run(args).await.context("serve")?;
        }
    }

    Ok(())
}
