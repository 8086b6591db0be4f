//! runhub CLI Entry Point
//!
//! Provides the command-line interface to the run orchestrator and the
//! run store.
//!
//! # Usage
//!
//! ```bash
//! # Run workflows one after another and follow their progress
//! runhub run nightly report --input '{"day": "monday"}'
//!
//! # Give up (cancel) after ten minutes
//! runhub run nightly --timeout 600
//!
//! # Browse past runs
//! runhub list --workflow nightly --status failed --limit 20
//! runhub show 0b3c2d9e-5d0f-4f7e-9a57-1c1a4c2f6a11
//!
//! # Maintenance
//! runhub refresh-index
//! runhub stats
//! ```

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use colored::{ColoredString, Colorize};
use log::{error, info, warn};
use serde_json::Value;

use runhub::config::RunnerConfig;
use runhub::execution::{run_worker, Orchestrator, RunUpdate};
use runhub::monitoring::ExecutionTimeline;
use runhub::run::{summarize, timestamp, RunStatus};
use runhub::store::{RunQuery, RunStore};
use runhub::{APP_NAME, VERSION};

/// Default page size for `list`.
const DEFAULT_LIST_LIMIT: usize = 20;

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Run {
        workflow_ids: Vec<String>,
        input: Option<String>,
        timeout: Option<Duration>,
    },
    List {
        workflow: Option<String>,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    },
    Show {
        run_id: String,
    },
    Delete {
        run_id: String,
    },
    RefreshIndex,
    Stats,
    Worker {
        workflow_id: String,
        args_json: String,
    },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    data_dir: Option<PathBuf>,
    workflows_dir: Option<PathBuf>,
    verbose: bool,
}

impl Config {
    fn runner_config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.set_data_dir(dir);
        }
        if let Some(dir) = &self.workflows_dir {
            config.set_workflows_dir(dir);
        }
        config
    }
}

/// Configures the logging system with appropriate formatting.
///
/// Output goes to stderr; in worker mode that is relayed into the run log.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: runhub [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  run <WORKFLOW>...       Run workflows in order and follow their progress");
    println!("      --input JSON        Input object passed to every run (default: {{}})");
    println!("      --timeout SECS      Cancel runs still active after SECS seconds");
    println!("  list                    List runs, newest first");
    println!("      --workflow ID       Only runs of this workflow");
    println!("      --status STATUS     Only runs with this status");
    println!("      --limit N           Page size (default: {})", DEFAULT_LIST_LIMIT);
    println!("      --offset N          Entries to skip");
    println!("  show <RUN_ID>           Show a run with its steps, timeline and logs");
    println!("  delete <RUN_ID>         Delete a finished run");
    println!("  refresh-index           Reconcile the run index with the run files");
    println!("  stats                   Per-workflow run statistics");
    println!();
    println!("Options:");
    println!("  --data-dir PATH         Data directory (default: ~/.runhub)");
    println!("  --workflows-dir PATH    Workflow definitions (default: <data-dir>/workflows)");
    println!("  --verbose               Enable debug logging");
    println!("  --help                  Show this help message");
    println!("  --version               Show version information");
}

fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut data_dir = None;
    let mut workflows_dir = None;
    let mut verbose = false;
    let mut input = None;
    let mut timeout = None;
    let mut workflow = None;
    let mut status = None;
    let mut limit = DEFAULT_LIST_LIMIT;
    let mut offset = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--workflows-dir" => {
                workflows_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--input" => {
                input = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--timeout" => {
                let secs: u64 = parse_number(option_value(args, &mut i, arg)?, "timeout")?;
                timeout = Some(Duration::from_secs(secs));
            }
            "--workflow" => {
                workflow = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--status" => {
                status = Some(option_value(args, &mut i, arg)?.parse::<RunStatus>()?);
            }
            "--limit" => {
                limit = parse_number(option_value(args, &mut i, arg)?, "limit")?;
            }
            "--offset" => {
                offset = parse_number(option_value(args, &mut i, arg)?, "offset")?;
            }
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional
        .next()
        .ok_or_else(|| "No command given".to_string())?;
    let rest: Vec<String> = positional.collect();

    let single = |what: &str| -> Result<String, String> {
        match rest.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(format!("{} requires {}", name, what)),
            _ => Err(format!("{} takes a single {}", name, what)),
        }
    };

    let command = match name.as_str() {
        "run" => {
            if rest.is_empty() {
                return Err("run requires at least one workflow id".to_string());
            }
            Command::Run {
                workflow_ids: rest.clone(),
                input,
                timeout,
            }
        }
        "list" => Command::List {
            workflow,
            status,
            limit,
            offset,
        },
        "show" => Command::Show {
            run_id: single("a run id")?,
        },
        "delete" => Command::Delete {
            run_id: single("a run id")?,
        },
        "refresh-index" => Command::RefreshIndex,
        "stats" => Command::Stats,
        "worker" => match rest.as_slice() {
            [workflow_id, args_json] => Command::Worker {
                workflow_id: workflow_id.clone(),
                args_json: args_json.clone(),
            },
            _ => return Err("worker requires <workflow_id> <args_json>".to_string()),
        },
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(Config {
        command,
        data_dir,
        workflows_dir,
        verbose,
    })
}

/// Status word coloured for terminal output.
fn paint(status: RunStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        RunStatus::Pending => text.dimmed(),
        RunStatus::Running => text.cyan(),
        RunStatus::Completed => text.green(),
        RunStatus::Failed => text.red().bold(),
        RunStatus::Cancelled => text.yellow(),
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn format_duration(ms: Option<u64>) -> String {
    match ms {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{}ms", ms),
        None => "-".to_string(),
    }
}

/// Submits the workflows and follows them until they are all terminal.
fn run_workflows(
    config: RunnerConfig,
    workflow_ids: &[String],
    input: Option<&str>,
    timeout: Option<Duration>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).map_err(|e| format!("Invalid --input JSON: {}", e))?,
        None => Value::Object(Default::default()),
    };

    info!("Data directory: {}", config.data_dir.display());
    let orchestrator = Orchestrator::start(config)?;
    let updates = orchestrator.subscribe();

    let mut active: HashSet<String> = HashSet::new();
    let mut submitted = Vec::new();
    for workflow_id in workflow_ids {
        let run_id = orchestrator.submit(workflow_id, input.clone())?;
        println!("{} {} queued as {}", "▶".bold(), workflow_id, run_id);
        active.insert(run_id.clone());
        submitted.push(run_id);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;

    while !active.is_empty() {
        if !timed_out && deadline.map_or(false, |d| Instant::now() >= d) {
            warn!("Timeout reached, cancelling {} active runs", active.len());
            for run_id in &active {
                orchestrator.cancel(run_id);
            }
            timed_out = true;
        }

        match updates.recv_timeout(Duration::from_millis(200)) {
            Ok(RunUpdate::Status { run_id, status }) => {
                println!("[{}] {}", short_id(&run_id), paint(status));
                if status.is_terminal() {
                    active.remove(&run_id);
                }
            }
            Ok(RunUpdate::Step { run_id, event }) => {
                let detail = event
                    .error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default();
                println!(
                    "[{}]   step {} {:?}{}",
                    short_id(&run_id),
                    event.step_id.bold(),
                    event.kind,
                    detail
                );
            }
            Ok(RunUpdate::Log { run_id, line }) => {
                println!("[{}]   {}", short_id(&run_id), line.dimmed());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!();
    let mut all_completed = true;
    for run_id in &submitted {
        match orchestrator.get(run_id)? {
            Some(record) => {
                all_completed &= record.status == RunStatus::Completed;
                println!(
                    "{}  {:<20} {:<10} {}",
                    run_id,
                    record.workflow_id,
                    paint(record.status),
                    format_duration(record.duration_ms)
                );
                if let Some(error) = &record.error {
                    println!("    {}", error.red());
                }
            }
            None => {
                all_completed = false;
                error!("Run {} disappeared from the store", run_id);
            }
        }
    }

    orchestrator.shutdown();
    Ok(all_completed)
}

fn list_runs(
    store: &RunStore,
    workflow: Option<String>,
    status: Option<RunStatus>,
    limit: usize,
    offset: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut query = RunQuery::new(limit).offset(offset);
    if let Some(workflow) = workflow {
        query = query.workflow(workflow);
    }
    if let Some(status) = status {
        query = query.status(status);
    }

    let page = store.list(&query)?;
    for entry in &page.entries {
        let started = entry
            .started_at
            .as_ref()
            .map(timestamp::format)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<20} {:<10} {:<28} {}",
            entry.id,
            entry.workflow_id,
            paint(entry.status),
            started,
            format_duration(entry.duration_ms)
        );
    }
    println!(
        "\n{} of {} runs (offset {})",
        page.entries.len(),
        page.total,
        offset
    );
    Ok(())
}

fn show_run(store: &RunStore, run_id: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let Some(record) = store.get(run_id)? else {
        eprintln!("Run {} not found", run_id);
        return Ok(false);
    };

    println!("{}", record.id.bold());
    println!("  Workflow:  {} ({})", record.workflow_name, record.workflow_id);
    println!("  Status:    {}", paint(record.status));
    if let Some(started) = &record.started_at {
        println!("  Started:   {}", timestamp::format(started));
    }
    if let Some(completed) = &record.completed_at {
        println!("  Finished:  {}", timestamp::format(completed));
    }
    println!("  Duration:  {}", format_duration(record.duration_ms));
    println!("  Input:     {}", record.input_data);
    if let Some(output) = &record.output_data {
        println!("  Output:    {}", output);
    }
    if let Some(file) = &record.output_file {
        println!("  Output at: {}", file);
    }
    if let Some(error) = &record.error {
        let at = record
            .error_step
            .as_deref()
            .map(|s| format!(" (step {})", s))
            .unwrap_or_default();
        println!("  Error:     {}{}", error.red(), at);
    }

    println!("\nSteps:");
    for step in record.steps.iter() {
        println!(
            "  {:<20} {:<10} {}",
            step.step_id,
            paint(step.status),
            format_duration(step.duration_ms)
        );
    }

    print!("{}", ExecutionTimeline::from_record(&record).gantt_chart());

    if !record.logs.is_empty() {
        println!("\nLogs:");
        for line in &record.logs {
            println!("  {}", line);
        }
    }
    Ok(true)
}

fn print_stats(store: &RunStore) {
    let entries = store.entries();
    let stats = summarize(&entries);
    if stats.is_empty() {
        println!("No runs recorded");
        return;
    }

    println!(
        "{:<20} {:>6} {:>9} {:>7} {:>9} {:>8} {:>10}",
        "WORKFLOW", "RUNS", "COMPLETED", "FAILED", "CANCELLED", "SUCCESS", "AVG"
    );
    for s in stats.values() {
        let rate = s
            .success_rate
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:>6} {:>9} {:>7} {:>9} {:>8} {:>10}",
            s.workflow_id,
            s.total,
            s.completed,
            s.failed,
            s.cancelled,
            rate,
            format_duration(s.average_duration_ms)
        );
    }
}

fn exit_status(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Main application entry point.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    let runner_config = config.runner_config();
    let open_store = || {
        RunStore::open_with(
            &runner_config.data_dir,
            runner_config.index_capacity,
            runner_config.record_cache_capacity,
        )
    };

    match config.command {
        Command::Worker {
            ref workflow_id,
            ref args_json,
        } => {
            // Reports through stdout and the exit code
            let code = run_worker(&runner_config.workflows_dir, workflow_id, args_json);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Command::Run {
            ref workflow_ids,
            ref input,
            timeout,
        } => {
            let completed =
                run_workflows(runner_config.clone(), workflow_ids, input.as_deref(), timeout)?;
            Ok(exit_status(completed))
        }
        Command::List {
            workflow,
            status,
            limit,
            offset,
        } => {
            list_runs(&open_store()?, workflow, status, limit, offset)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { ref run_id } => Ok(exit_status(show_run(&open_store()?, run_id)?)),
        Command::Delete { ref run_id } => {
            let deleted = open_store()?.delete(run_id)?;
            if deleted {
                println!("Deleted run {}", run_id);
            } else {
                eprintln!("Run {} not found", run_id);
            }
            Ok(exit_status(deleted))
        }
        Command::RefreshIndex => {
            let store = open_store()?;
            let changed = store.refresh_index()?;
            println!("Index refreshed: {} changes, {} runs", changed, store.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            print_stats(&open_store()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("runhub")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_with_options() {
        let config = parse_arguments(&args(&[
            "--data-dir",
            "/tmp/rh",
            "run",
            "a",
            "b",
            "--input",
            "{}",
            "--timeout",
            "30",
        ]))
        .unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/rh")));
        assert_eq!(
            config.command,
            Command::Run {
                workflow_ids: vec!["a".into(), "b".into()],
                input: Some("{}".into()),
                timeout: Some(Duration::from_secs(30)),
            }
        );
    }

    #[test]
    fn test_parse_list_filters() {
        let config =
            parse_arguments(&args(&["list", "--status", "failed", "--limit", "5"])).unwrap();
        assert_eq!(
            config.command,
            Command::List {
                workflow: None,
                status: Some(RunStatus::Failed),
                limit: 5,
                offset: 0,
            }
        );
    }

    #[test]
    fn test_parse_worker_mode() {
        let config = parse_arguments(&args(&[
            "worker",
            "--workflows-dir",
            "/wf",
            "nightly",
            r#"{"run_id":"r1"}"#,
        ]))
        .unwrap();
        assert_eq!(config.workflows_dir, Some(PathBuf::from("/wf")));
        assert_eq!(
            config.command,
            Command::Worker {
                workflow_id: "nightly".into(),
                args_json: r#"{"run_id":"r1"}"#.into(),
            }
        );
        assert_eq!(
            config.runner_config().workflows_dir,
            PathBuf::from("/wf")
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["run"])).is_err());
        assert!(parse_arguments(&args(&["show"])).is_err());
        assert!(parse_arguments(&args(&["show", "a", "b"])).is_err());
        assert!(parse_arguments(&args(&["list", "--limit"])).is_err());
        assert!(parse_arguments(&args(&["list", "--status", "bogus"])).is_err());
        assert!(parse_arguments(&args(&["frobnicate"])).is_err());
        assert!(parse_arguments(&args(&["stats", "--nope"])).is_err());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(250)), "250ms");
        assert_eq!(format_duration(Some(1500)), "1.5s");
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
