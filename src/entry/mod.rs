mod commands;
mod summary;

#[cfg(test)]
mod tests;

use clap::{ArgMatches, CommandFactory, FromArgMatches};

use crate::args::{Cli, Command};
use crate::error::AppResult;

/// Parses the command line, installs logging, and runs the chosen
/// subcommand on a multi-threaded runtime.
///
/// # Errors
///
/// Returns the subcommand's error, or an error when the runtime cannot be
/// built.
pub fn run() -> AppResult<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    crate::logger::init_logging(cli.verbose, cli.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(dispatch(cli, &matches))
}

async fn dispatch(cli: Cli, matches: &ArgMatches) -> AppResult<()> {
    match cli.command {
        Command::Agent(args) => {
            let agent_matches = matches
                .subcommand_matches("agent")
                .cloned()
                .unwrap_or_default();
            commands::agent(&args, &agent_matches).await
        }
        Command::Run(args) => commands::run_plan(&args).await,
        Command::Discover(args) => commands::discover(&args).await,
        Command::Status(args) => commands::status(&args).await,
    }
}
