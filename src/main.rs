//! AQE CLI entry point.

use aqe::cli::{
    handle_init, handle_memory, handle_start, handle_submit, Cli, Commands, EXIT_CONFIG_ERROR,
    EXIT_RUNTIME_ERROR,
};
use aqe::infrastructure::config::ConfigLoader;
use aqe::infrastructure::logging::init_logging;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Init needs no configuration or fleet.
    if let Commands::Init { force } = cli.command {
        let code = match handle_init(force) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                EXIT_RUNTIME_ERROR
            }
        };
        std::process::exit(code);
    }

    let config = match cli
        .config
        .as_deref()
        .map_or_else(ConfigLoader::load, ConfigLoader::load_from_file)
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let result = match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Start { max_agents } => handle_start(config, max_agents).await,
        Commands::Submit(args) => handle_submit(config, args).await,
        Commands::Memory { command } => handle_memory(config, command).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_RUNTIME_ERROR
        }
    };
    std::process::exit(code);
}
