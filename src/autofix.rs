//! Turn confident rules and weak spots into concrete edits for one file.

use anyhow::{Context, Result};
use colored::Colorize;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::atomic_write::{AtomicWriter, WriteOptions};
use crate::learning::{log_fix_result, FixAttempt, FixOutcome};
use crate::model::{BugType, MutationOperator, Rule, WeakSpot};
use crate::scanner::{local_binding, IMPORT_RE};
use crate::source_text::{identifier_counts, LineIndex};
use crate::store::{filter, GraphStore, Props, RecordStore, StoreError};
use crate::test_exec::{TestCommand, TestOutcome};

/// Rules at or below this confidence are never turned into edits.
pub const AUTOFIX_MIN_CONFIDENCE: u8 = 70;

lazy_static! {
    static ref ASYNC_FN_RE: Regex =
        Regex::new(r"\basync\s+function\s+([A-Za-z_$][\w$]*)\s*\([^)]*\)\s*\{").unwrap();
    static ref TRY_RE: Regex = Regex::new(r"\btry\b").unwrap();
    static ref CATCH_RE: Regex = Regex::new(r"\bcatch\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Rule(BugType),
    WeakSpot,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanKind::Rule(kind) => write!(f, "{kind}"),
            PlanKind::WeakSpot => f.write_str("WEAK_SPOT"),
        }
    }
}

impl Serialize for PlanKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixAction {
    /// Replace `span` of the planned-against content.
    Edit {
        #[serde(skip)]
        span: Range<usize>,
        replacement: String,
    },
    /// Someone has to write a test.
    NeedsTest {
        operator: MutationOperator,
        suggestion: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixPlan {
    #[serde(rename = "type")]
    pub kind: PlanKind,
    pub file: String,
    pub line: usize,
    pub confidence: Option<u8>,
    pub description: String,
    #[serde(flatten)]
    pub action: FixAction,
}

impl FixPlan {
    pub fn is_mechanical(&self) -> bool {
        matches!(self.action, FixAction::Edit { .. })
    }

    /// `content` with this edit applied; unchanged for test plans.
    pub fn apply_to(&self, content: &str) -> String {
        match &self.action {
            FixAction::Edit { span, replacement } => {
                let mut out = String::with_capacity(content.len() + replacement.len());
                out.push_str(&content[..span.start]);
                out.push_str(replacement);
                out.push_str(&content[span.end..]);
                out
            }
            FixAction::NeedsTest { .. } => content.to_string(),
        }
    }
}

/// Edits for every rule above the autofix threshold (most confident first),
/// then one test proposal per weak spot in `file`.
pub fn plan_fixes(
    memory: &dyn GraphStore,
    file: &str,
    content: &str,
) -> Result<Vec<FixPlan>, StoreError> {
    let mut rules: Vec<Rule> = memory
        .match_records::<Rule>(&Props::new())?
        .into_iter()
        .filter(|r| r.confidence > AUTOFIX_MIN_CONFIDENCE)
        .collect();
    rules.sort_by(|a, b| b.confidence.cmp(&a.confidence));

    let mut plans = Vec::new();
    for rule in &rules {
        match rule.kind {
            BugType::MissingErrorHandling => {
                plans.extend(plan_error_handling(file, content, rule.confidence))
            }
            BugType::UnusedImport => plans.extend(plan_unused_imports(file, content, rule.confidence)),
            _ => {}
        }
    }

    let mut spots: Vec<WeakSpot> = memory.match_records(&filter([("file", json!(file))]))?;
    spots.sort_by(|a, b| (b.severity, b.count).cmp(&(a.severity, a.count)));
    plans.extend(spots.into_iter().map(|w| FixPlan {
        kind: PlanKind::WeakSpot,
        file: file.to_string(),
        line: w.line,
        confidence: None,
        description: format!("Add test: {}", w.suggestion),
        action: FixAction::NeedsTest {
            operator: w.operator,
            suggestion: w.suggestion,
        },
    }));
    Ok(plans)
}

fn plan_error_handling(file: &str, content: &str, confidence: u8) -> Vec<FixPlan> {
    let lines = LineIndex::new(content);
    let mut plans = Vec::new();
    for caps in ASYNC_FN_RE.captures_iter(content) {
        let (Some(decl), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let open = decl.end() - 1;
        let Some(close) = matching_brace(content, open) else {
            continue;
        };
        let body = &content[open + 1..close];
        if TRY_RE.is_match(body) && CATCH_RE.is_match(body) {
            continue;
        }
        let name = name.as_str();
        let inner = body.trim_matches(|c| c == '\n' || c == '\r');
        let replacement = format!(
            "\n  try {{\n{}\n  }} catch (error) {{\n    console.error(`Error in {name}:`, error);\n    throw error;\n  }}\n",
            indent(inner)
        );
        plans.push(FixPlan {
            kind: PlanKind::Rule(BugType::MissingErrorHandling),
            file: file.to_string(),
            line: lines.line_of(decl.start()),
            confidence: Some(confidence),
            description: format!("Add try-catch block to {name}"),
            action: FixAction::Edit {
                span: open + 1..close,
                replacement,
            },
        });
    }
    plans
}

/// Byte offset of the `}` closing the `{` at `open`. Braces inside strings
/// and comments are counted too.
fn matching_brace(content: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in content.bytes().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| if l.trim().is_empty() { String::new() } else { format!("  {l}") })
        .collect::<Vec<_>>()
        .join("\n")
}

fn plan_unused_imports(file: &str, content: &str, confidence: u8) -> Vec<FixPlan> {
    let counts = identifier_counts(content);
    let lines = LineIndex::new(content);
    let mut plans = Vec::new();

    for caps in IMPORT_RE.captures_iter(content) {
        let (Some(stmt), Some(list), Some(module)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let items: Vec<&str> = list
            .as_str()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        for (idx, item) in items.iter().enumerate() {
            let Some(binding) = local_binding(item) else { continue };
            if counts.get(binding).copied().unwrap_or(0) != 1 {
                continue;
            }
            let (span, replacement) = if items.len() == 1 {
                (statement_line_span(content, stmt.range()), String::new())
            } else {
                let kept: Vec<&str> = items
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, s)| *s)
                    .collect();
                (list.range(), format!(" {} ", kept.join(", ")))
            };
            plans.push(FixPlan {
                kind: PlanKind::Rule(BugType::UnusedImport),
                file: file.to_string(),
                line: lines.line_of(stmt.start()),
                confidence: Some(confidence),
                description: format!(
                    "Remove unused import: {binding} from {}",
                    module.as_str()
                ),
                action: FixAction::Edit { span, replacement },
            });
        }
    }
    plans
}

/// The statement plus its line's indentation, a trailing `;` and newline.
fn statement_line_span(content: &str, stmt: Range<usize>) -> Range<usize> {
    let start = content[..stmt.start]
        .rfind('\n')
        .map(|i| i + 1)
        .filter(|&i| content[i..stmt.start].trim().is_empty())
        .unwrap_or(stmt.start);
    let rest = &content[stmt.end..];
    let mut end = stmt.end;
    if rest.starts_with(';') {
        end += 1;
    }
    if content[end..].starts_with("\r\n") {
        end += 2;
    } else if content[end..].starts_with('\n') {
        end += 1;
    }
    start..end
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedFix {
    pub plan: FixPlan,
    pub applied: bool,
    pub error: Option<String>,
}

impl AppliedFix {
    fn new(plan: FixPlan, outcome: FixOutcome) -> Self {
        Self {
            plan,
            applied: outcome.applied,
            error: outcome.error,
        }
    }
}

/// Apply mechanical plans one at a time, re-planning against the new content
/// after each edit, and feed every outcome back into the learning loop.
/// With `verify`, a failing test run reverts the edit and counts as a failed
/// fix. A run that timed out, failed to launch or was cancelled also reverts
/// the edit but is not recorded, so it never moves a rule's confidence.
pub fn apply_fixes(
    memory: &dyn GraphStore,
    path: &Path,
    verify: Option<&TestCommand>,
    cancel: &AtomicBool,
) -> Result<Vec<AppliedFix>> {
    let label = path.to_string_lossy().into_owned();
    let mut content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let writer = AtomicWriter::new(WriteOptions::durable());
    let mut attempted = HashSet::new();
    let mut results = Vec::new();

    while !cancel.load(Ordering::SeqCst) {
        let plans = plan_fixes(memory, &label, &content)?;
        let Some(plan) = plans
            .into_iter()
            .find(|p| p.is_mechanical() && !attempted.contains(&p.description))
        else {
            break;
        };
        attempted.insert(plan.description.clone());
        let PlanKind::Rule(kind) = plan.kind else { continue };

        let updated = plan.apply_to(&content);
        if let Err(e) = writer.write_str(path, &updated) {
            let outcome = FixOutcome {
                applied: false,
                error: Some(format!("{e:#}")),
            };
            record(memory, kind, &label, &plan, &outcome);
            results.push(AppliedFix::new(plan, outcome));
            continue;
        }

        let verdict = verify.map(|cmd| cmd.run(&plan.description, cancel).outcome);
        match verdict.as_ref().map(|o| (o, o.survived())) {
            None | Some((_, Some(true))) => {
                content = updated;
                let outcome = FixOutcome {
                    applied: true,
                    error: None,
                };
                record(memory, kind, &label, &plan, &outcome);
                results.push(AppliedFix::new(plan, outcome));
            }
            Some((failed, Some(false))) => {
                revert(&writer, path, &content)?;
                let outcome = FixOutcome {
                    applied: true,
                    error: Some(format!("verification failed: {failed:?}")),
                };
                record(memory, kind, &label, &plan, &outcome);
                results.push(AppliedFix::new(plan, outcome));
            }
            Some((inconclusive, None)) => {
                revert(&writer, path, &content)?;
                warn!(
                    fix = %plan.description,
                    outcome = ?inconclusive,
                    "verification inconclusive; fix reverted and not recorded"
                );
                let stop = *inconclusive == TestOutcome::Cancelled;
                results.push(AppliedFix::new(
                    plan,
                    FixOutcome {
                        applied: false,
                        error: Some(format!("verification inconclusive: {inconclusive:?}")),
                    },
                ));
                if stop {
                    break;
                }
            }
        }
    }
    Ok(results)
}

fn revert(writer: &AtomicWriter, path: &Path, content: &str) -> Result<()> {
    writer
        .write_str(path, content)
        .map(|_| ())
        .with_context(|| format!("Failed to revert {}", path.display()))
}

fn record(
    memory: &dyn GraphStore,
    kind: BugType,
    label: &str,
    plan: &FixPlan,
    outcome: &FixOutcome,
) {
    let attempt = FixAttempt {
        kind,
        file: Some(label.to_string()),
        description: plan.description.clone(),
    };
    if let Err(e) = log_fix_result(memory, &attempt, outcome) {
        warn!(error = %e, "failed to record fix result");
    }
}

pub fn print_plans(plans: &[FixPlan]) {
    if plans.is_empty() {
        println!("no fixes planned (rules need confidence above {AUTOFIX_MIN_CONFIDENCE}%)");
        return;
    }
    for plan in plans {
        let confidence = plan
            .confidence
            .map(|c| format!("{c:>3}%"))
            .unwrap_or_else(|| "   -".to_string());
        let marker = if plan.is_mechanical() {
            "auto ".green()
        } else {
            "test ".yellow()
        };
        println!(
            "{} [{}] {}:{} {}",
            marker, confidence, plan.file, plan.line, plan.description
        );
    }
}

pub fn print_applied(results: &[AppliedFix]) {
    for r in results {
        let status = match (&r.error, r.applied) {
            (None, true) => "applied".green().bold(),
            (Some(_), true) => "reverted".red().bold(),
            (Some(e), false) if e.starts_with("verification inconclusive") => {
                "skipped".yellow().bold()
            }
            _ => "failed".red().bold(),
        };
        println!("{} {}:{} {}", status, r.plan.file, r.plan.line, r.plan.description);
        if let Some(e) = &r.error {
            println!("    {e}");
        }
    }
    let ok = results.iter().filter(|r| r.applied && r.error.is_none()).count();
    println!("{} {ok}/{} fixes applied", "autofix:".bold(), results.len());
}
