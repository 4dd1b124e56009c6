//! CLI argument parsing and validation module
//!
//! Handles command-line interface using clap, including:
//! - `monitor`: stream enriched lifecycle records
//! - `snapshot`: enrich every running process once
//! - `identify`: binary identity of files on disk
//! - Global options: configuration file, verbosity, log backend

use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::SourceKind;
use crate::constants::{POLLING_INTERVAL_MAX, POLLING_INTERVAL_MIN};
use crate::models::EnrichmentMode;

const VERSION: &str = concat!(env!("PROCINFO_VERSION"), " (", env!("GIT_HASH"), ")");

/// Parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub verbosity: u8,
    pub log_uls: bool,
    pub command: CliCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Monitor {
        /// None keeps the configured mode
        mode: Option<EnrichmentMode>,
        json: bool,
        source: Option<SourceKind>,
        interval: Option<f64>,
        path_filters: Vec<PathBuf>,
    },
    Snapshot {
        mode: Option<EnrichmentMode>,
        json: bool,
        path_filters: Vec<PathBuf>,
    },
    Identify {
        json: bool,
        paths: Vec<PathBuf>,
    },
}

fn full_arg() -> Arg {
    Arg::new("full")
        .short('f')
        .long("full")
        .help("Hash, verify signatures and extract entitlements for every record")
        .action(ArgAction::SetTrue)
}

fn json_arg() -> Arg {
    Arg::new("json")
        .short('j')
        .long("json")
        .help("Output one JSON object per record")
        .action(ArgAction::SetTrue)
}

fn path_filter_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .value_name("PREFIX")
        .help("Only report executables under this path (repeatable)")
        .value_parser(value_parser!(PathBuf))
        .action(ArgAction::Append)
}

/// Build the clap command tree
pub fn build_command() -> Command {
    Command::new("procinfo")
        .version(VERSION)
        .about("Monitor process lifecycle events and enrich them with binary identity")
        .long_about(
            "Observes process creation and termination, and describes each process with its \
             ancestry, executable hash, code-signing status and entitlements.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: <config dir>/procinfo/config.toml)")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("log-uls")
                .long("log-uls")
                .help("Send logs to the macOS Unified Logging System instead of stderr")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("monitor")
                .about("Stream enriched process lifecycle records until interrupted")
                .arg(full_arg())
                .arg(json_arg())
                .arg(
                    Arg::new("source")
                        .short('s')
                        .long("source")
                        .value_name("SOURCE")
                        .help("Event source")
                        .value_parser(["polling", "audit-pipe"]),
                )
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Polling interval in seconds (0.1-300.0)")
                        .value_parser(value_parser!(f64)),
                )
                .arg(path_filter_arg()),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Describe every currently running process")
                .arg(full_arg())
                .arg(json_arg())
                .arg(path_filter_arg()),
        )
        .subcommand(
            Command::new("identify")
                .about("Show the binary identity of executables on disk")
                .arg(json_arg())
                .arg(
                    Arg::new("paths")
                        .value_name("PATH")
                        .help("Executable to identify")
                        .value_parser(value_parser!(PathBuf))
                        .num_args(1..)
                        .required(true),
                ),
        )
}

/// Parse command line arguments and return configuration
pub fn parse_args() -> Result<CliArgs> {
    from_matches(&build_command().get_matches())
}

/// Parse an explicit argument list
pub fn parse_from<I, T>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = build_command().try_get_matches_from(args)?;
    from_matches(&matches)
}

fn from_matches(matches: &ArgMatches) -> Result<CliArgs> {
    let command = match matches.subcommand() {
        Some(("monitor", sub)) => {
            let interval = sub.get_one::<f64>("interval").copied();
            if let Some(interval) = interval {
                if !(POLLING_INTERVAL_MIN..=POLLING_INTERVAL_MAX).contains(&interval) {
                    return Err(anyhow!(
                        "Invalid polling interval: {}. Must be between 0.1 and 300.0 seconds",
                        interval
                    ));
                }
            }
            let source = sub
                .get_one::<String>("source")
                .map(|source| source.parse::<SourceKind>().map_err(|e| anyhow!(e)))
                .transpose()?;

            CliCommand::Monitor {
                mode: mode_flag(sub),
                json: sub.get_flag("json"),
                source,
                interval,
                path_filters: path_values(sub, "path"),
            }
        }
        Some(("snapshot", sub)) => CliCommand::Snapshot {
            mode: mode_flag(sub),
            json: sub.get_flag("json"),
            path_filters: path_values(sub, "path"),
        },
        Some(("identify", sub)) => CliCommand::Identify {
            json: sub.get_flag("json"),
            paths: path_values(sub, "paths"),
        },
        _ => return Err(anyhow!("No command given; see --help")),
    };

    Ok(CliArgs {
        config_path: matches.get_one::<PathBuf>("config").cloned(),
        verbosity: matches.get_count("verbose"),
        log_uls: matches.get_flag("log-uls"),
        command,
    })
}

fn mode_flag(matches: &ArgMatches) -> Option<EnrichmentMode> {
    matches.get_flag("full").then_some(EnrichmentMode::Full)
}

fn path_values(matches: &ArgMatches, id: &str) -> Vec<PathBuf> {
    matches
        .get_many::<PathBuf>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definition_is_consistent() {
        build_command().debug_assert();
    }

    #[test]
    fn test_monitor_defaults() {
        let args = parse_from(["procinfo", "monitor"]).unwrap();
        assert_eq!(args.verbosity, 0);
        assert!(!args.log_uls);
        assert_eq!(
            args.command,
            CliCommand::Monitor {
                mode: None,
                json: false,
                source: None,
                interval: None,
                path_filters: vec![],
            }
        );
    }

    #[test]
    fn test_monitor_all_options() {
        let args = parse_from([
            "procinfo", "-vv", "monitor", "--full", "--json", "--source", "audit-pipe",
            "--interval", "0.5", "--path", "/Applications", "-p", "/usr/bin",
        ])
        .unwrap();

        assert_eq!(args.verbosity, 2);
        assert_eq!(
            args.command,
            CliCommand::Monitor {
                mode: Some(EnrichmentMode::Full),
                json: true,
                source: Some(SourceKind::AuditPipe),
                interval: Some(0.5),
                path_filters: vec![PathBuf::from("/Applications"), PathBuf::from("/usr/bin")],
            }
        );
    }

    #[test]
    fn test_interval_out_of_range() {
        assert!(parse_from(["procinfo", "monitor", "--interval", "0.01"]).is_err());
        assert!(parse_from(["procinfo", "monitor", "--interval", "301"]).is_err());
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(parse_from(["procinfo", "monitor", "--source", "dtrace"]).is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = parse_from(["procinfo", "snapshot", "--config", "/tmp/p.toml", "-v"]).unwrap();
        assert_eq!(args.config_path, Some(PathBuf::from("/tmp/p.toml")));
        assert_eq!(args.verbosity, 1);
    }

    #[test]
    fn test_identify_requires_path() {
        assert!(parse_from(["procinfo", "identify"]).is_err());

        let args = parse_from(["procinfo", "identify", "/bin/ls", "/bin/cat"]).unwrap();
        assert_eq!(
            args.command,
            CliCommand::Identify {
                json: false,
                paths: vec![PathBuf::from("/bin/ls"), PathBuf::from("/bin/cat")],
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(parse_from(["procinfo"]).is_err());
    }
}
