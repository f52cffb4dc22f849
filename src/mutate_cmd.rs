//! Mutation engine: mutate a file on disk one mutant at a time, run the
//! user's tests against each, and record which mutants survived.

use anyhow::{Context, Result};
use colored::Colorize;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::file_swap::{FileSwap, MutationError};
use crate::model::{MutationOperator, MutationRecord, Record};
use crate::mutate_ops::{generate_mutants, Mutant};
use crate::store::{filter, Graph, GraphClient, GraphStore, RecordStore, StoreError};
use crate::test_exec::{TestCommand, TestOutcome, TestRun};

#[derive(Debug, Clone)]
pub struct MutationOptions {
    pub test: TestCommand,
    pub operators: Vec<MutationOperator>,
    /// Print one line per mutant.
    pub progress: bool,
    /// Echo the test command's output under each progress line.
    pub show_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationSummary {
    pub file: String,
    /// Mutants with a verdict (`killed + survived`).
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    /// Timed out, failed to launch, or cancelled. Not persisted.
    pub indeterminate: usize,
    pub score: f64,
    pub cancelled: bool,
}

/// `killed / (killed + survived) * 100`, or 0 with no verdicts.
pub fn mutation_score(killed: usize, survived: usize) -> f64 {
    let total = killed + survived;
    if total == 0 {
        0.0
    } else {
        killed as f64 / total as f64 * 100.0
    }
}

/// Mutate `file` once per generated mutant and classify each against the
/// test command. The file is back to its original bytes when this returns,
/// whatever the result, unless the error says otherwise.
pub fn run_mutation_testing(
    file: &Path,
    opts: &MutationOptions,
    store: Option<&dyn GraphStore>,
    cancel: &AtomicBool,
) -> Result<MutationSummary, MutationError> {
    let mut swap = FileSwap::acquire(file)?;
    let source = swap.original().to_string();
    let label = file.to_string_lossy().into_owned();
    let mutants = generate_mutants(&label, &source, &opts.operators);
    info!(file = %label, mutants = mutants.len(), "mutation run started");

    let mut summary = MutationSummary {
        file: label,
        ..Default::default()
    };

    for mutant in &mutants {
        if cancel.load(Ordering::SeqCst) {
            summary.cancelled = true;
            break;
        }

        swap.install(&mutant.render(&source))?;
        let run = opts.test.run(&mutant.id, cancel);
        swap.restore()?;
        debug!(
            mutant = %mutant.id,
            duration_ms = run.duration.as_millis() as u64,
            stdout = %run.stdout,
            stderr = %run.stderr,
            "test output"
        );

        match run.outcome.survived() {
            Some(survived) => {
                if survived {
                    summary.survived += 1;
                } else {
                    summary.killed += 1;
                }
                if opts.progress {
                    print_verdict(mutant, survived, &run);
                    if opts.show_output {
                        print_test_output(&run);
                    }
                }
                if let Some(store) = store {
                    if let Err(e) = store.create_record(&mutant.to_record(survived)) {
                        warn!(mutant = %mutant.id, error = %e, "failed to persist mutation");
                    }
                }
            }
            None => {
                summary.indeterminate += 1;
                match &run.outcome {
                    TestOutcome::Cancelled => {
                        summary.cancelled = true;
                        break;
                    }
                    TestOutcome::TimedOut => {
                        warn!(mutant = %mutant.id, "test command timed out; mutant skipped")
                    }
                    TestOutcome::LaunchFailed(reason) => {
                        warn!(mutant = %mutant.id, %reason, "test command failed to launch; mutant skipped")
                    }
                    _ => {}
                }
                if opts.progress {
                    println!("  {} {} line {}", "SKIPPED ".yellow(), mutant.id, mutant.line);
                }
            }
        }
    }

    drop(swap);
    summary.total = summary.killed + summary.survived;
    summary.score = mutation_score(summary.killed, summary.survived);
    Ok(summary)
}

fn print_verdict(mutant: &Mutant, survived: bool, run: &TestRun) {
    let verdict = if survived {
        "SURVIVED".red().bold()
    } else {
        "KILLED  ".green()
    };
    println!(
        "  {} {} line {}: {} → {} {}",
        verdict,
        mutant.operator,
        mutant.line,
        mutant.original,
        display_replacement(mutant),
        format!("({}ms)", run.duration.as_millis()).dimmed()
    );
}

fn print_test_output(run: &TestRun) {
    for line in run.stdout.lines().chain(run.stderr.lines()) {
        println!("      {}", line.dimmed());
    }
}

fn display_replacement(mutant: &Mutant) -> &str {
    if mutant.mutated.is_empty() {
        "(removed)"
    } else {
        &mutant.mutated
    }
}

/// Mutants that would be run, without touching the file.
pub fn list_mutants(file: &Path, operators: &[MutationOperator]) -> Result<Vec<Mutant>> {
    let source =
        fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(generate_mutants(&file.to_string_lossy(), &source, operators))
}

pub fn print_dry_run(file: &Path, mutants: &[Mutant]) {
    println!("{} ({} mutants)", file.display().to_string().bold(), mutants.len());
    for m in mutants {
        println!(
            "  {:<22} line {:<5} {} → {}",
            m.operator.as_str(),
            m.line,
            m.original,
            display_replacement(m)
        );
    }
}

/// Run several files on a bounded pool. Two mutants of the same file never
/// run at once: paths are de-duplicated here and each file run holds its
/// lock throughout. Each task opens its own store session.
///
/// A fatal error in one file raises `cancel` so the others stop early.
pub fn run_many(
    files: &[PathBuf],
    opts: &MutationOptions,
    client: Option<&GraphClient>,
    jobs: usize,
    cancel: &AtomicBool,
) -> Result<Vec<(PathBuf, Result<MutationSummary, MutationError>)>> {
    let mut seen = HashSet::new();
    let unique: Vec<PathBuf> = files
        .iter()
        .filter(|f| seen.insert(fs::canonicalize(f).unwrap_or_else(|_| f.to_path_buf())))
        .cloned()
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .context("Failed to start mutation workers")?;

    Ok(pool.install(|| {
        unique
            .par_iter()
            .map(|file| {
                let session = client.and_then(|c| match c.session(Graph::Mutations) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(error = %e, "graph store unavailable; results will not be saved");
                        None
                    }
                });
                let result = run_mutation_testing(
                    file,
                    opts,
                    session.as_ref().map(|s| s as &dyn GraphStore),
                    cancel,
                );
                if matches!(&result, Err(e) if e.may_leave_mutated()) {
                    cancel.store(true, Ordering::SeqCst);
                }
                (file.clone(), result)
            })
            .collect()
    }))
}

pub fn print_summary(summary: &MutationSummary) {
    let score = format!("{:.1}%", summary.score);
    let score = if summary.total == 0 {
        score.dimmed()
    } else if summary.score >= 80.0 {
        score.green().bold()
    } else if summary.score >= 50.0 {
        score.yellow().bold()
    } else {
        score.red().bold()
    };
    println!(
        "{} {}: {} mutants, {} killed, {} survived, score {}",
        "mutate:".bold(),
        summary.file,
        summary.total,
        summary.killed,
        summary.survived,
        score
    );
    if summary.indeterminate > 0 {
        println!("  {} indeterminate (timeout/launch failure/cancelled)", summary.indeterminate);
    }
    if summary.cancelled {
        println!("  {}", "run cancelled; file restored".yellow());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationScore {
    pub total: u64,
    pub killed: u64,
    pub survived: u64,
    pub score: f64,
}

/// Score over every persisted mutation.
pub fn analyze_mutation_score(store: &dyn GraphStore) -> Result<MutationScore, StoreError> {
    let survived = store.count(
        MutationRecord::LABEL,
        &filter([("survived", serde_json::json!(true))]),
    )?;
    let killed = store.count(
        MutationRecord::LABEL,
        &filter([("survived", serde_json::json!(false))]),
    )?;
    Ok(MutationScore {
        total: killed + survived,
        killed,
        survived,
        score: mutation_score(killed as usize, survived as usize),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurvivorSpot {
    pub file: String,
    pub line: u64,
    pub operator: String,
    pub count: u64,
}

/// `(file, line, operator)` triples with survived mutants, most first.
pub fn find_weak_spots(store: &dyn GraphStore, limit: usize) -> Result<Vec<SurvivorSpot>, StoreError> {
    Ok(store
        .aggregate(
            MutationRecord::LABEL,
            &["file", "line", "operator"],
            &filter([("survived", serde_json::json!(true))]),
            None,
        )?
        .into_iter()
        .take(limit)
        .map(|g| SurvivorSpot {
            file: g.key_str(0).unwrap_or_default().to_string(),
            line: g.key_u64(1).unwrap_or(0),
            operator: g.key_str(2).unwrap_or_default().to_string(),
            count: g.count,
        })
        .collect())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::tests::isolated_store;
    use std::time::Duration;
    use tempfile::TempDir;

    const EQ_SOURCE: &str = "const eq = (a, b) => a === b;\nmodule.exports = eq;\n";

    fn project(body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("eq.js");
        fs::write(&file, body).unwrap();
        (dir, file)
    }

    fn options(dir: &TempDir, cmd: &str) -> MutationOptions {
        MutationOptions {
            test: TestCommand::new(cmd, dir.path()).with_timeout(Some(Duration::from_secs(30))),
            operators: MutationOperator::ALL.to_vec(),
            progress: false,
            show_output: false,
        }
    }

    #[test]
    fn failing_test_kills_the_mutant_and_file_is_restored() {
        let (dir, file) = project(EQ_SOURCE);
        let db = isolated_store();
        let session = db.client.session(Graph::Mutations).unwrap();
        let never = AtomicBool::new(false);

        let summary = run_mutation_testing(
            &file,
            &options(&dir, "grep -q '===' eq.js"),
            Some(&session),
            &never,
        )
        .unwrap();

        assert_eq!(summary.total, 1);
        assert_eq!(summary.killed, 1);
        assert_eq!(summary.survived, 0);
        assert_eq!(summary.score, 100.0);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);

        let records: Vec<MutationRecord> = session.match_records(&Default::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].survived);
        assert_eq!(records[0].operator, MutationOperator::EqToNeq);
        assert_eq!(records[0].line, 1);
    }

    #[test]
    fn passing_test_means_survivors_and_weak_spots() {
        let (dir, file) = project("let on = true;\nlet off = true;\n");
        let db = isolated_store();
        let session = db.client.session(Graph::Mutations).unwrap();
        let never = AtomicBool::new(false);

        let summary =
            run_mutation_testing(&file, &options(&dir, "true"), Some(&session), &never).unwrap();
        assert_eq!(summary.survived, 2);
        assert_eq!(summary.score, 0.0);

        let spots = find_weak_spots(&session, 10).unwrap();
        assert_eq!(spots.len(), 2);
        assert_eq!(spots[0].operator, "TRUE_TO_FALSE");
        assert_eq!(spots[0].count, 1);

        let global = analyze_mutation_score(&session).unwrap();
        assert_eq!(global.total, 2);
        assert_eq!(global.survived, 2);
    }

    #[test]
    fn each_mutant_sees_only_its_own_change() {
        // the test fails only when line 2 was mutated
        let (dir, file) = project("a = true;\nb = true;\n");
        let never = AtomicBool::new(false);
        let summary = run_mutation_testing(
            &file,
            &options(&dir, "sed -n 2p eq.js | grep -q true"),
            None,
            &never,
        )
        .unwrap();
        assert_eq!(summary.killed, 1);
        assert_eq!(summary.survived, 1);
        assert_eq!(summary.score, 50.0);
    }

    #[test]
    fn timeout_is_indeterminate_and_restores() {
        let (dir, file) = project(EQ_SOURCE);
        let mut opts = options(&dir, "sleep 5");
        opts.test = opts.test.with_timeout(Some(Duration::from_millis(300)));
        let never = AtomicBool::new(false);

        let summary = run_mutation_testing(&file, &opts, None, &never).unwrap();
        assert_eq!(summary.indeterminate, 1);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.score, 0.0);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);
    }

    #[test]
    fn launch_failure_is_indeterminate() {
        let (dir, file) = project(EQ_SOURCE);
        let mut opts = options(&dir, "true");
        opts.test.cwd = dir.path().join("missing");
        let never = AtomicBool::new(false);
        let summary = run_mutation_testing(&file, &opts, None, &never).unwrap();
        assert_eq!(summary.indeterminate, 1);
        assert_eq!(summary.killed + summary.survived, 0);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);
    }

    #[test]
    fn cancelled_run_stops_without_mutating() {
        let (dir, file) = project(EQ_SOURCE);
        let cancel = AtomicBool::new(true);
        let summary = run_mutation_testing(&file, &options(&dir, "true"), None, &cancel).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.total, 0);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);
    }

    #[test]
    fn score_stays_in_bounds() {
        assert_eq!(mutation_score(0, 0), 0.0);
        assert_eq!(mutation_score(3, 0), 100.0);
        assert_eq!(mutation_score(0, 3), 0.0);
        for k in 0..6 {
            for s in 0..6 {
                let score = mutation_score(k, s);
                assert!((0.0..=100.0).contains(&score));
                assert_eq!(score == 100.0, s == 0 && k > 0);
            }
        }
    }

    #[test]
    fn run_many_collapses_duplicate_paths() {
        let (dir, file) = project(EQ_SOURCE);
        let other = dir.path().join("other.js");
        fs::write(&other, "x = 1;\n").unwrap();
        let dotted = dir.path().join(".").join("eq.js");
        let db = isolated_store();
        let never = AtomicBool::new(false);

        let results = run_many(
            &[file.clone(), dotted, other],
            &options(&dir, "false"),
            Some(&db.client),
            2,
            &never,
        )
        .unwrap();
        assert_eq!(results.len(), 2);
        for (_, result) in &results {
            assert_eq!(result.as_ref().unwrap().score, 100.0);
        }
        let session = db.client.session(Graph::Mutations).unwrap();
        assert_eq!(analyze_mutation_score(&session).unwrap().total, 2);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);
    }

    #[test]
    fn lost_parent_dir_is_fatal_and_cancels_remaining_work() {
        let dir = TempDir::new().unwrap();
        let proj = dir.path().join("proj");
        fs::create_dir(&proj).unwrap();
        let file = proj.join("eq.js");
        fs::write(&file, EQ_SOURCE).unwrap();
        // the test run swaps the source's directory for a plain file
        let opts = options(&dir, "mv proj moved && echo blocked > proj");
        let cancel = AtomicBool::new(false);

        let results = run_many(&[file.clone()], &opts, None, 1, &cancel).unwrap();
        assert_eq!(results.len(), 1);
        let err = results[0].1.as_ref().unwrap_err();
        assert!(matches!(err, MutationError::RestoreFailed { .. }), "{err}");
        assert!(err.may_leave_mutated());
        assert!(err.to_string().contains("eq.js"));
        assert!(cancel.load(Ordering::SeqCst));

        let left = fs::read_to_string(dir.path().join("moved").join("eq.js")).unwrap();
        assert_eq!(left, EQ_SOURCE.replace("===", "!=="));
    }

    #[test]
    fn dry_run_lists_without_touching() {
        let (_dir, file) = project(EQ_SOURCE);
        let mutants = list_mutants(&file, &MutationOperator::ALL).unwrap();
        assert_eq!(mutants.len(), 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), EQ_SOURCE);
    }
}
