//! Command-line interface of the channel daemon.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments; every option overrides its config file value.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub server_id: Option<String>,
    /// Never compete for the master
    pub no_master: bool,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

fn command() -> Command {
    Command::new("channeld")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Channel server hosting ordered, replicated channel workers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("channeld.toml"),
        )
        .arg(
            Arg::new("server-id")
                .short('s')
                .long("server-id")
                .value_name("ID")
                .help("Name of this channel server"),
        )
        .arg(
            Arg::new("no-master")
                .long("no-master")
                .help("Do not compete to host the master")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("channeld.toml")),
            server_id: matches.get_one::<String>("server-id").cloned(),
            no_master: matches.get_flag("no-master"),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(&command().get_matches_from(args))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["channeld"]);
        assert_eq!(args.config_path, PathBuf::from("channeld.toml"));
        assert_eq!(args.server_id, None);
        assert!(!args.no_master);
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = parse(&[
            "channeld",
            "-c",
            "/etc/channeld.toml",
            "--server-id",
            "cs4",
            "--no-master",
            "-l",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/channeld.toml"));
        assert_eq!(args.server_id.as_deref(), Some("cs4"));
        assert!(args.no_master);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }
}
