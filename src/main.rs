use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use sharefile::{api, config::Config, utils};

#[derive(Parser)]
#[command(name = "sharefile", version, about = "Password-protected file sharing server")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("sharefile.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    if args.daemon {
        run_daemon()?;
    }

    let config = Config::load(&args.config)?;

    let port = match args.command {
        Some(Commands::Serve { port }) => port,
        None => 8080,
    };

    info!("starting server on port {port}");
    api::serve(config, port).await?;

    Ok(())
}
