use clap::Parser;
use memscope::{
    attach,
    cli::Cli,
    commands::{self, required_access},
    logging,
};

async fn wrapped_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let handle = attach(&cli.target, required_access(&cli.command)).await?;
    commands::run(&handle, cli.command, cli.json)?;

    handle.close()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = wrapped_main().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
