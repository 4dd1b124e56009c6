#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procinfo::cli::{self, CliCommand};
use procinfo::config::{ProcInfoConfig, SourceKind};
use procinfo::models::{EnrichmentMode, Process};
use procinfo::{logging, output, ProcInfo};

fn main() -> Result<()> {
    let args = cli::parse_args()?;
    logging::init_logger(args.verbosity, args.log_uls)?;

    let config = ProcInfoConfig::load_or_default(args.config_path.as_deref())
        .context("Failed to load configuration")?;

    // Set up interrupt handling
    let interrupted = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, interrupted.clone());

    match args.command {
        CliCommand::Monitor {
            mode,
            json,
            source,
            interval,
            path_filters,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.monitor.mode = mode;
            }
            if let Some(source) = source {
                config.monitor.source = source;
            }
            if let Some(interval) = interval {
                config.monitor.polling_interval = interval;
            }
            config.validate()?;
            run_monitor(&config, json, path_filters, interrupted)
        }
        CliCommand::Snapshot {
            mode,
            json,
            path_filters,
        } => run_snapshot(&one_shot(config), mode, json, &path_filters),
        CliCommand::Identify { json, paths } => run_identify(&one_shot(config), json, &paths),
    }
}

/// Snapshot and identify never subscribe, so any configured feed is irrelevant
fn one_shot(mut config: ProcInfoConfig) -> ProcInfoConfig {
    config.monitor.source = SourceKind::Polling;
    config
}

fn run_monitor(
    config: &ProcInfoConfig,
    json: bool,
    path_filters: Vec<PathBuf>,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let procinfo = ProcInfo::new(config).context("Failed to initialize process monitor")?;
    let mode = config.monitor.mode;

    if !json {
        eprintln!(
            "Starting process monitoring ({:?} enrichment, {:?} source)...",
            mode, config.monitor.source
        );
        if !path_filters.is_empty() {
            eprintln!(
                "Monitoring {} for processes",
                path_filters
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        eprintln!("Press Ctrl+C to stop monitoring.");
    }

    procinfo
        .start(mode, move |process| {
            if output::matches_path_filters(&process, &path_filters) {
                print_process(&process, json);
            }
        })
        .context("Failed to start monitoring")?;

    while !interrupted.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    procinfo.stop()?;
    if !json {
        eprintln!("Monitoring stopped.");
    }
    Ok(())
}

fn run_snapshot(
    config: &ProcInfoConfig,
    mode: Option<EnrichmentMode>,
    json: bool,
    path_filters: &[PathBuf],
) -> Result<()> {
    let procinfo = ProcInfo::new(config)?;
    let processes = match mode {
        Some(mode) => procinfo.snapshot(mode),
        None => procinfo.current_processes(),
    };

    for process in processes
        .iter()
        .filter(|process| output::matches_path_filters(process, path_filters))
    {
        print_process(process, json);
    }
    Ok(())
}

fn run_identify(config: &ProcInfoConfig, json: bool, paths: &[PathBuf]) -> Result<()> {
    let procinfo = ProcInfo::new(config)?;
    let mut failed = 0;

    for path in paths {
        if !path.is_file() {
            eprintln!("Warning: Could not read {}", path.display());
            failed += 1;
            continue;
        }

        let binary = procinfo.binaries().resolve(path, EnrichmentMode::Full);
        if json {
            println!("{}", output::format_binary_json(&binary)?);
        } else {
            println!("{}", output::format_binary_human(&binary));
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} paths could not be identified", failed, paths.len()));
    }
    Ok(())
}

fn print_process(process: &Process, json: bool) {
    let rendered = if json {
        output::format_process_json(process)
    } else {
        output::format_process_human(process)
    };

    match rendered {
        Ok(text) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", text);
        }
        Err(e) => log::warn!("failed to render record for pid {}: {}", process.pid, e),
    }
}
