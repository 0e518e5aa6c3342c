use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use nornicdb::config::Config;
use nornicdb::engine::Engine;

#[derive(Parser)]
#[command(name = "nornicdb", version, about = "NornicDB graph database server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true, env = "NORNICDB_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info", env = "NORNICDB_LOG")]
    log: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (the default).
    Serve,
    /// Write a checkpoint snapshot for the data directory and exit.
    Checkpoint,
    /// Print the effective configuration and exit.
    Config,
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("failed to start runtime: {err}");
                    return ExitCode::from(1);
                }
            };
            match runtime.block_on(nornicdb::server::serve(config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("server error: {err}");
                    ExitCode::from(1)
                }
            }
        }
        Command::Checkpoint => match Engine::open(&config) {
            Ok(engine) => match engine.checkpoint() {
                Ok(info) => {
                    println!(
                        "checkpoint written: base_seq={} nodes={} relationships={}",
                        info.base_seq, info.nodes, info.edges
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("checkpoint failed: {err}");
                    ExitCode::from(1)
                }
            },
            Err(err) => {
                eprintln!("failed to open engine: {err}");
                ExitCode::from(1)
            }
        },
        Command::Config => match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("failed to render configuration: {err}");
                ExitCode::from(1)
            }
        },
    }
}
