//! CLI command definitions using `clap`.

use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("fuzzfleet")
        .about("Orchestrate remote fuzzing-fleet locations")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .default_value("fuzzfleet.toml")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("location")
                .long("location")
                .short('l')
                .value_name("TAG")
                .action(ArgAction::Append)
                .help("Location to operate on (repeatable; default: all configured)"),
        )
        .subcommand(
            Command::new("up").about("Create a job and bring its agents up at each location"),
        )
        .subcommand(
            Command::new("down")
                .about("Drain, archive and clean up every job at each location"),
        )
        .subcommand(
            Command::new("deploy")
                .about("Build the agent binaries and ship them to each worker")
                .arg(
                    Arg::new("keep-build")
                        .long("keep-build")
                        .action(ArgAction::SetTrue)
                        .help("Reuse the existing build tree instead of cleaning it"),
                ),
        )
        .subcommand(
            Command::new("all")
                .about("Full refresh: down, deploy, up")
                .arg(
                    Arg::new("keep-build")
                        .long("keep-build")
                        .action(ArgAction::SetTrue)
                        .help("Reuse the existing build tree instead of cleaning it"),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Print one statistics snapshot per active job as JSON"),
        )
        .subcommand(Command::new("jobs").about("List jobs known to each location"))
}
