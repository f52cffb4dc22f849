mod atomic_write;
mod autofix;
mod config;
mod dashboard;
mod file_swap;
mod learning;
mod memory;
mod model;
mod mutate_cmd;
mod mutate_ops;
mod scanner;
mod signals;
mod source_text;
mod store;
mod test_exec;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use config::Config;
use model::{BugType, MutationOperator, WeakSpotKey};
use store::{Graph, GraphClient, GraphSession, GraphStore};

#[derive(Parser)]
#[command(
    name = "kata",
    version,
    about = "Bug pattern scanning, mutation testing and a learning loop over both",
    long_about = "Scans JS/TS sources for known bug patterns, mutates files to find weak tests, \
                  and learns confidence-scored rules and weak spots from the results."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan files or directories for bug patterns and record the findings
    Scan {
        /// Files or directories to scan
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Extensions to include (repeatable; replaces the configured list)
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Detection threads (0 = one per core)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Mutate files and run the test command against every mutant
    Mutate {
        /// Source files to mutate
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Shell command that runs the tests (exit 0 = pass)
        #[arg(short, long)]
        test: String,

        /// Per-mutant timeout in seconds (0 = none)
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory for the test command
        #[arg(long)]
        root: Option<PathBuf>,

        /// Operators or categories to use, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        operators: Vec<String>,

        /// List the mutants without running anything
        #[arg(long)]
        dry_run: bool,

        /// Files mutated concurrently
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Turn recorded bugs and survived mutants into rules and weak spots
    Learn {
        #[arg(long, conflicts_with = "mutations_only")]
        bugs_only: bool,

        #[arg(long)]
        mutations_only: bool,
    },

    /// Learned rules and weak spots relevant to a file
    Recommend { file: String },

    /// Rules whose pattern occurs in a file
    Fixes { file: PathBuf },

    /// Plan (and optionally apply) concrete fixes for a file
    Autofix {
        file: PathBuf,

        /// Write the mechanical fixes to disk
        #[arg(long)]
        apply: bool,

        /// Test command that must pass for an applied fix to be kept
        #[arg(long, requires = "apply")]
        test: Option<String>,

        /// Working directory for the test command
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Record the outcome of a fix
    FixLog {
        /// Bug type (e.g. UNUSED_IMPORT)
        kind: String,
        file: String,
        #[arg(value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
        applied: bool,
        #[arg(value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
        success: bool,
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Record a test written for a weak spot
    TestLog {
        file: String,
        line: usize,
        /// Mutation operator (e.g. EQ_TO_NEQ)
        operator: String,
        #[arg(value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
        test_added: bool,
        #[arg(value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
        test_passed: bool,
    },

    /// Learning loop statistics
    Stats,

    /// Export rules, recent fix results and weak spots
    Export {
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },

    /// Overview of everything recorded so far
    Report {
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Bug counts per type over everything scanned
    Patterns,

    /// Lines where mutants survive most often
    WeakSpots {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show or create the configuration file
    Config {
        /// Write the default config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("KATA_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    signals::install();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    if let Commands::Config { init } = cli.command {
        config::show_config(init)?;
        return Ok(0);
    }

    let verbose = cli.verbose;
    let config = Config::load()?;
    if !config.display.colors {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Scan {
            paths,
            extensions,
            jobs,
        } => run_scan(&config, &paths, extensions, jobs),

        Commands::Mutate {
            files,
            test,
            timeout,
            root,
            operators,
            dry_run,
            jobs,
        } => {
            let operators = mutate_ops::select_operators(&operators)?;
            if dry_run {
                for file in &files {
                    let mutants = mutate_cmd::list_mutants(file, &operators)?;
                    mutate_cmd::print_dry_run(file, &mutants);
                }
                return Ok(0);
            }
            let timeout = timeout.unwrap_or(config.mutation.timeout_secs);
            let root = match root {
                Some(root) => root,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let jobs = jobs.unwrap_or(config.mutation.jobs).max(1);
            let opts = mutate_cmd::MutationOptions {
                test: test_exec::TestCommand::new(test, root)
                    .with_timeout((timeout > 0).then(|| Duration::from_secs(timeout))),
                operators,
                progress: jobs == 1,
                show_output: verbose >= 2,
            };
            run_mutate(&config, &files, &opts, jobs)
        }

        Commands::Learn {
            bugs_only,
            mutations_only,
        } => {
            let client = GraphClient::connect(&config.store)?;
            let memory = client.session(Graph::Memory)?;
            if !mutations_only {
                let bugs = client.session(Graph::Bugs)?;
                let report = memory::learn_from_bugs(&bugs, &memory)?;
                println!(
                    "{} {} rule(s) created, {} updated",
                    "learn:".bold(),
                    report.created,
                    report.updated
                );
            }
            if !bugs_only {
                let mutations = client.session(Graph::Mutations)?;
                let report = memory::learn_from_mutations(&mutations, &memory)?;
                println!(
                    "{} {} weak spot(s) created, {} updated",
                    "learn:".bold(),
                    report.created,
                    report.updated
                );
            }
            let summary = memory::memory_report(&memory)?;
            println!(
                "  {} rules (avg confidence {:.1}%), {} weak spots",
                summary.rules, summary.avg_confidence, summary.weak_spots
            );
            Ok(0)
        }

        Commands::Recommend { file } => {
            let memory = open_memory(&config)?;
            let recs = memory::get_recommendations(&memory, &file)?;
            memory::print_recommendations(&file, &recs);
            Ok(0)
        }

        Commands::Fixes { file } => {
            let content = read_source(&file)?;
            let memory = open_memory(&config)?;
            let fixes = memory::generate_auto_fixes(&memory, &file.to_string_lossy(), &content)?;
            memory::print_auto_fixes(&fixes);
            Ok(0)
        }

        Commands::Autofix {
            file,
            apply,
            test,
            root,
        } => {
            let memory = open_memory(&config)?;
            if !apply {
                let content = read_source(&file)?;
                let plans = autofix::plan_fixes(&memory, &file.to_string_lossy(), &content)?;
                autofix::print_plans(&plans);
                return Ok(0);
            }
            let verify = match test {
                Some(cmd) => {
                    let root = match root {
                        Some(root) => root,
                        None => std::env::current_dir()
                            .context("Failed to read current directory")?,
                    };
                    let secs = config.mutation.timeout_secs;
                    Some(
                        test_exec::TestCommand::new(cmd, root)
                            .with_timeout((secs > 0).then(|| Duration::from_secs(secs))),
                    )
                }
                None => None,
            };
            let results =
                autofix::apply_fixes(&memory, &file, verify.as_ref(), signals::cancel_flag())?;
            autofix::print_applied(&results);
            Ok(if signals::is_cancelled() {
                signals::EXIT_CANCELLED
            } else {
                0
            })
        }

        Commands::FixLog {
            kind,
            file,
            applied,
            success,
            description,
        } => {
            let kind: BugType = kind.parse()?;
            let memory = open_memory(&config)?;
            let attempt = learning::FixAttempt {
                kind,
                file: Some(file),
                description,
            };
            let outcome = learning::FixOutcome {
                applied,
                error: (applied && !success).then(|| "reported as failed".to_string()),
            };
            let result = learning::log_fix_result(&memory, &attempt, &outcome)?;
            println!(
                "{} {} {} ({})",
                "fix-log:".bold(),
                result.id,
                if result.success {
                    "success".green()
                } else if result.applied {
                    "failure".red()
                } else {
                    "not applied".dimmed()
                },
                result.file
            );
            Ok(0)
        }

        Commands::TestLog {
            file,
            line,
            operator,
            test_added,
            test_passed,
        } => {
            let operator: MutationOperator = operator.parse()?;
            let memory = open_memory(&config)?;
            let key = WeakSpotKey {
                file,
                line,
                operator,
            };
            let updated = learning::log_test_improvement(&memory, &key, test_added, test_passed)?;
            if updated == 0 {
                println!("no weak spot at {}:{} for {}", key.file, key.line, key.operator);
            } else {
                let state = if test_added && test_passed {
                    "fixed".green()
                } else {
                    "open".yellow()
                };
                println!("{} {} ({})", "test-log:".bold(), key.id(), state);
            }
            Ok(0)
        }

        Commands::Stats => {
            let memory = open_memory(&config)?;
            learning::print_learning_stats(&learning::get_learning_stats(&memory)?);
            Ok(0)
        }

        Commands::Export { format } => {
            let memory = open_memory(&config)?;
            let export = learning::export_learning_data(&memory)?;
            match format {
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&export)?),
                ExportFormat::Csv => learning::write_fixes_csv(&export.fixes, std::io::stdout())?,
            }
            Ok(0)
        }

        Commands::Report { format } => {
            let client = GraphClient::connect(&config.store)?;
            let data = dashboard::collect(&client)?;
            match format {
                ReportFormat::Text => dashboard::print_text(&data),
                ReportFormat::Json => dashboard::print_json(&data)?,
            }
            Ok(0)
        }

        Commands::Patterns => {
            let client = GraphClient::connect(&config.store)?;
            let bugs = client.session(Graph::Bugs)?;
            let patterns = scanner::analyze_bug_patterns(&bugs)?;
            if patterns.is_empty() {
                println!("no bugs recorded");
            }
            for p in &patterns {
                println!("{:<24} {:>5}  avg line {:.1}", p.kind, p.count, p.avg_line);
            }
            Ok(0)
        }

        Commands::WeakSpots { limit } => {
            let client = GraphClient::connect(&config.store)?;
            let mutations = client.session(Graph::Mutations)?;
            let spots = mutate_cmd::find_weak_spots(&mutations, limit)?;
            if spots.is_empty() {
                println!("no surviving mutants recorded");
            }
            for s in &spots {
                println!(
                    "{}:{} {:<20} {} survived",
                    s.file,
                    s.line,
                    s.operator,
                    s.count.to_string().red()
                );
            }
            Ok(0)
        }

        Commands::Config { .. } => Ok(0),
    }
}

fn open_memory(config: &Config) -> Result<GraphSession> {
    let client = GraphClient::connect(&config.store)?;
    Ok(client.session(Graph::Memory)?)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// A store that cannot be opened only costs persistence.
fn optional_client(config: &Config) -> Option<GraphClient> {
    match GraphClient::connect(&config.store) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "graph store unavailable; results will not be saved");
            None
        }
    }
}

fn run_scan(
    config: &Config,
    paths: &[PathBuf],
    extensions: Vec<String>,
    jobs: Option<usize>,
) -> Result<i32> {
    let mut scan_config = config.scan.clone();
    if !extensions.is_empty() {
        scan_config.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
    }
    let files = scanner::collect_files(paths, &scan_config)?;
    let scanner = scanner::Scanner::with_defaults(&scan_config);
    debug!(detectors = ?scanner.detector_names(), files = files.len(), "scan started");

    let client = optional_client(config);
    let session = client.as_ref().and_then(|c| match c.session(Graph::Bugs) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "graph store unavailable; results will not be saved");
            None
        }
    });
    let report = scanner::scan(
        &scanner,
        &files,
        session.as_ref().map(|s| s as &dyn GraphStore),
        jobs.unwrap_or(scan_config.jobs),
    )?;
    scanner::print_report(&report);
    Ok(0)
}

fn run_mutate(
    config: &Config,
    files: &[PathBuf],
    opts: &mutate_cmd::MutationOptions,
    jobs: usize,
) -> Result<i32> {
    let client = optional_client(config);
    let cancel = signals::cancel_flag();
    let results = mutate_cmd::run_many(files, opts, client.as_ref(), jobs, cancel)?;

    let mut failed = false;
    for (file, result) in &results {
        match result {
            Ok(summary) => mutate_cmd::print_summary(summary),
            Err(e) => {
                failed = true;
                eprintln!("{} {}: {}", "mutate:".red().bold(), file.display(), e);
            }
        }
    }

    Ok(if failed {
        1
    } else if signals::is_cancelled() {
        signals::EXIT_CANCELLED
    } else {
        0
    })
}
