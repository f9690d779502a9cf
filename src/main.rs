use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::commands::{registry, Command, State};
use gator::config::Config;
use gator::db::Database;
use gator::fetcher::Fetcher;

#[derive(Parser)]
#[command(name = "gator")]
#[command(about = "Follow RSS feeds and browse their posts", long_about = None)]
struct Cli {
    /// Command to run (register, login, users, reset, agg, addfeed, feeds, follow, following, unfollow, browse)
    command: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config::read()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.db_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    let mut state = State {
        db: Arc::new(db),
        config,
        fetcher: Fetcher::new()?,
        shutdown,
    };

    let cmd = Command::new(cli.command, cli.args);
    if let Err(e) = registry().run(&mut state, &cmd).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
