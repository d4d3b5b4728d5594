//! cowai CLI entry point.

use clap::Parser;

use cowai::cli::{commands, Cli, Commands};
use cowai::infrastructure::config::ConfigLoader;
use cowai::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::load_from_dir(&cli.dir) {
        Ok(config) => config,
        Err(err) => cowai::cli::handle_error(err, cli.json),
    };

    let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => logger,
        Err(err) => cowai::cli::handle_error(err, cli.json),
    };

    let result = match cli.command() {
        Commands::Serve => commands::serve::execute(&cli.dir, config).await,
        Commands::Status => commands::status::execute(&cli.dir, &config, cli.json).await,
        Commands::Activity(args) => commands::activity::execute(&cli.dir, &config, &args, cli.json).await,
        Commands::Config => commands::config::execute(&config, cli.json),
    };

    if let Err(err) = result {
        cowai::cli::handle_error(err, cli.json);
    }
}
