use clap::{Parser, Subcommand};

use tierfs::config::Config;
use tierfs::daemon;

#[derive(Parser)]
#[command(name = "tierfs")]
#[command(about = "Tiered-storage filesystem orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate configuration and remote reachability, then exit")]
    Check,
    #[command(about = "Run one migration cycle immediately and print its report")]
    Migrate,
    #[command(about = "Run the orchestrator as a long-lived foreground process")]
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command {
        Commands::Check => daemon::check(cfg).await,
        Commands::Migrate => {
            let report = daemon::migrate_once(cfg).await?;
            println!(
                "scanned {} transferred {} skipped {} failed {} pruned {}",
                report.scanned,
                report.transferred,
                report.skipped,
                report.failed,
                report.pruned_dirs
            );
            Ok(())
        }
        Commands::Serve => daemon::serve(cfg).await,
    }
}
