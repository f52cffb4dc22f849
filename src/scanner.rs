//! Heuristic bug-pattern scanner.
//!
//! Detectors are pure functions over raw text; the scanner walks files,
//! runs every registered detector, and hands the findings to the store.

use aho_corasick::AhoCorasick;
use anyhow::{Context, Result};
use colored::Colorize;
use ignore::WalkBuilder;
use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::model::{now_millis, Bug, BugType, Record, Severity};
use crate::source_text::{identifier_counts, looks_binary, LineIndex};
use crate::store::{GraphStore, RecordStore, StoreError};

lazy_static! {
    pub(crate) static ref IMPORT_RE: Regex =
        Regex::new(r#"import\s+\{([^}]+)\}\s+from\s+['"]([^'"]+)['"]"#).unwrap();
    static ref ASYNC_RE: Regex =
        Regex::new(r"\basync\s+function\b\s*\*?\s*([A-Za-z_$][\w$]*)?|\basync\s*\(").unwrap();
    static ref TRY_CATCH_RE: Regex = Regex::new(r"\b(try|catch)\b").unwrap();
    static ref TYPE_MISMATCH_RE: Regex =
        Regex::new(r"local\.(set|get|tee)\[0\] expected type (\w+), found (\w+)").unwrap();
    static ref LOGIC_ERROR_RE: Regex =
        Regex::new(r"test\.currentlyFailing\s*\?\s*false\s*:").unwrap();
    static ref PATH_MARKERS: AhoCorasick =
        AhoCorasick::new(["/Users/", "C:\\"]).unwrap();
}

/// A bug-pattern rule. Must not fail on any input.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, file: &str, content: &str) -> Vec<Bug>;
}

fn bug(
    kind: BugType,
    severity: Severity,
    file: &str,
    line: usize,
    message: String,
    pattern: &str,
) -> Bug {
    Bug {
        kind,
        severity,
        file: file.to_string(),
        line,
        message,
        suggestion: Some(kind.default_suggestion().to_string()),
        pattern: pattern.to_string(),
        timestamp: now_millis(),
    }
}

pub struct UnusedImport;

impl Detector for UnusedImport {
    fn name(&self) -> &'static str {
        "unused-import"
    }

    fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let mut imports = IMPORT_RE.captures_iter(content).peekable();
        if imports.peek().is_none() {
            return Vec::new();
        }
        let lines = LineIndex::new(content);
        let counts = identifier_counts(content);
        let mut bugs = Vec::new();

        for caps in imports {
            let (Some(whole), Some(list), Some(module)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let line = lines.line_of(whole.start());
            for binding in list.as_str().split(',').filter_map(local_binding) {
                if counts.get(binding).copied().unwrap_or(0) == 1 {
                    bugs.push(bug(
                        BugType::UnusedImport,
                        Severity::Low,
                        file,
                        line,
                        format!("Unused import '{binding}' from '{}'", module.as_str()),
                        binding,
                    ));
                }
            }
        }
        bugs
    }
}

/// `a` → `a`, `a as b` → `b`, `type T` → `T`.
pub(crate) fn local_binding(item: &str) -> Option<&str> {
    let item = item.trim();
    let item = item.strip_prefix("type ").map(str::trim).unwrap_or(item);
    let local = match item.rsplit_once(" as ") {
        Some((_, alias)) => alias.trim(),
        None => item,
    };
    let valid = !local.is_empty()
        && local
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        && !local.as_bytes()[0].is_ascii_digit();
    valid.then_some(local)
}

pub struct MissingErrorHandling {
    /// Lines after the declaration that still count as its body.
    pub window: usize,
}

impl Detector for MissingErrorHandling {
    fn name(&self) -> &'static str {
        "missing-error-handling"
    }

    fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let index = LineIndex::new(content);
        let lines: Vec<&str> = content.lines().collect();
        let mut bugs = Vec::new();

        for caps in ASYNC_RE.captures_iter(content) {
            let Some(decl) = caps.get(0) else { continue };
            let line = index.line_of(decl.start());
            let start = line.saturating_sub(1).min(lines.len());
            let end = (start + self.window + 1).min(lines.len());
            if lines[start..end].iter().any(|l| TRY_CATCH_RE.is_match(l)) {
                continue;
            }
            let (message, pattern) = match caps.get(1) {
                Some(name) => (
                    format!("Async function '{}' has no try/catch", name.as_str()),
                    name.as_str(),
                ),
                None => (
                    "Async function has no try/catch".to_string(),
                    decl.as_str(),
                ),
            };
            bugs.push(bug(
                BugType::MissingErrorHandling,
                Severity::Medium,
                file,
                line,
                message,
                pattern,
            ));
        }
        bugs
    }
}

pub struct HardcodedPath;

impl Detector for HardcodedPath {
    fn name(&self) -> &'static str {
        "hardcoded-path"
    }

    fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let index = LineIndex::new(content);
        let mut seen = BTreeSet::new();
        let mut bugs = Vec::new();
        for m in PATH_MARKERS.find_iter(content) {
            let line = index.line_of(m.start());
            if !seen.insert(line) {
                continue;
            }
            let marker = &content[m.start()..m.end()];
            bugs.push(bug(
                BugType::HardcodedPath,
                Severity::Medium,
                file,
                line,
                format!("Hardcoded absolute path ({marker})"),
                marker,
            ));
        }
        bugs
    }
}

pub struct TypeMismatch;

impl Detector for TypeMismatch {
    fn name(&self) -> &'static str {
        "type-mismatch"
    }

    fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let index = LineIndex::new(content);
        TYPE_MISMATCH_RE
            .captures_iter(content)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(bug(
                    BugType::TypeMismatch,
                    Severity::High,
                    file,
                    index.line_of(whole.start()),
                    format!(
                        "local.{} expected {}, found {}",
                        &caps[1], &caps[2], &caps[3]
                    ),
                    whole.as_str(),
                ))
            })
            .collect()
    }
}

pub struct LogicError;

impl Detector for LogicError {
    fn name(&self) -> &'static str {
        "logic-error"
    }

    fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let index = LineIndex::new(content);
        LOGIC_ERROR_RE
            .find_iter(content)
            .map(|m| {
                bug(
                    BugType::LogicError,
                    Severity::High,
                    file,
                    index.line_of(m.start()),
                    "currentlyFailing forces the result to false".to_string(),
                    m.as_str(),
                )
            })
            .collect()
    }
}

pub struct Scanner {
    detectors: Vec<Box<dyn Detector>>,
}

impl Scanner {
    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    pub fn with_defaults(config: &ScanConfig) -> Self {
        let mut scanner = Self::empty();
        scanner.register(Box::new(TypeMismatch));
        scanner.register(Box::new(HardcodedPath));
        scanner.register(Box::new(UnusedImport));
        scanner.register(Box::new(MissingErrorHandling {
            window: config.async_window,
        }));
        scanner.register(Box::new(LogicError));
        scanner
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// All findings for one text, by line then detector order.
    pub fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
        let mut bugs: Vec<Bug> = self
            .detectors
            .iter()
            .flat_map(|d| {
                let found = d.detect(file, content);
                debug!(detector = d.name(), file, count = found.len(), "detector done");
                found
            })
            .collect();
        bugs.sort_by_key(|b| b.line);
        bugs
    }

    /// `None` when the file is unreadable or not text.
    pub fn scan_file(&self, path: &Path) -> Option<Vec<Bug>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable file");
                return None;
            }
        };
        if looks_binary(&bytes) {
            warn!(file = %path.display(), "skipping binary file");
            return None;
        }
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!(file = %path.display(), "skipping non-UTF-8 file");
                return None;
            }
        };
        Some(self.detect(&path.to_string_lossy(), &content))
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub persisted: usize,
    pub bugs: Vec<Bug>,
}

/// Expand the CLI arguments into a sorted, de-duplicated file list.
/// Directories are walked (gitignore-aware); explicit files are kept as-is.
pub fn collect_files(paths: &[PathBuf], config: &ScanConfig) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for root in paths {
        let meta = fs::metadata(root)
            .with_context(|| format!("Cannot scan {}", root.display()))?;
        if meta.is_file() {
            files.insert(root.clone());
            continue;
        }

        let ignore_dirs = config.ignore_dirs.clone();
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .parents(true)
            .follow_links(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                !(is_dir
                    && ignore_dirs
                        .iter()
                        .any(|d| entry.file_name().to_string_lossy() == d.as_str()))
            });

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "walk error");
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let matches_ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| config.extensions.iter().any(|want| want == ext))
                .unwrap_or(false);
            if matches_ext {
                files.insert(entry.into_path());
            }
        }
    }
    Ok(files.into_iter().collect())
}

/// Detect in parallel, then persist each file's findings as one batch.
/// Store failures are logged; the findings are still returned.
pub fn scan(
    scanner: &Scanner,
    files: &[PathBuf],
    store: Option<&dyn GraphStore>,
    jobs: usize,
) -> Result<ScanReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("Failed to start scan workers")?;
    let results: Vec<Option<Vec<Bug>>> =
        pool.install(|| files.par_iter().map(|f| scanner.scan_file(f)).collect());

    let mut report = ScanReport::default();
    for (path, result) in files.iter().zip(results) {
        let Some(bugs) = result else {
            report.files_skipped += 1;
            continue;
        };
        report.files_scanned += 1;
        if let Some(store) = store {
            match store.create_records(&bugs) {
                Ok(n) => report.persisted += n,
                Err(e) => warn!(file = %path.display(), error = %e, "failed to persist bugs"),
            }
        }
        report.bugs.extend(bugs);
    }
    Ok(report)
}

pub fn print_report(report: &ScanReport) {
    for bug in &report.bugs {
        let severity = match bug.severity {
            Severity::High => bug.severity.as_str().red().bold(),
            Severity::Medium => bug.severity.as_str().yellow(),
            Severity::Low => bug.severity.as_str().dimmed(),
        };
        println!(
            "{}:{} [{}] {} {}",
            bug.file, bug.line, severity, bug.kind, bug.message
        );
        if let Some(s) = &bug.suggestion {
            println!("    → {s}");
        }
    }
    println!(
        "\n{} {} bug(s) in {} file(s){}",
        "scan:".bold(),
        report.bugs.len(),
        report.files_scanned,
        if report.files_skipped > 0 {
            format!(", {} skipped", report.files_skipped)
        } else {
            String::new()
        }
    );
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BugPattern {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u64,
    pub avg_line: f64,
}

/// Per-type bug counts over everything ever scanned, most frequent first.
pub fn analyze_bug_patterns(store: &dyn GraphStore) -> Result<Vec<BugPattern>, StoreError> {
    Ok(store
        .aggregate(Bug::LABEL, &["type"], &Default::default(), Some("line"))?
        .into_iter()
        .map(|g| BugPattern {
            kind: g.key_str(0).unwrap_or("UNKNOWN").to_string(),
            count: g.count,
            avg_line: g.avg.unwrap_or(0.0),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::isolated_store;
    use crate::store::Graph;

    fn scan_text(content: &str) -> Vec<Bug> {
        Scanner::with_defaults(&ScanConfig::default()).detect("a.ts", content)
    }

    #[test]
    fn unused_import_reported_once_per_binding() {
        let src = "import { used, unused, x as y } from './mod';\nused();\n";
        let bugs = scan_text(src);
        let unused: Vec<_> = bugs
            .iter()
            .filter(|b| b.kind == BugType::UnusedImport)
            .map(|b| b.pattern.as_str())
            .collect();
        assert_eq!(unused, vec!["unused", "y"]);
        assert!(bugs.iter().all(|b| b.line == 1));
        assert_eq!(bugs[0].severity, Severity::Low);
    }

    #[test]
    fn import_usage_is_whole_word() {
        let src = "import { map } from 'lodash';\nconst mapping = 1;\n";
        let bugs = scan_text(src);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].message, "Unused import 'map' from 'lodash'");
    }

    #[test]
    fn async_without_try_catch_is_reported_at_declaration() {
        let src = "const x = 1;\n\nasync function load() {\n  await fetch(url);\n}\n";
        let bugs = scan_text(src);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].kind, BugType::MissingErrorHandling);
        assert_eq!(bugs[0].severity, Severity::Medium);
        assert_eq!(bugs[0].line, 3);
        assert_eq!(bugs[0].suggestion.as_deref(), Some("Add try-catch block"));
    }

    #[test]
    fn try_within_window_suppresses_error_handling_bug() {
        let src = "async function load() {\n  try {\n    await go();\n  } catch (e) {}\n}\n";
        assert!(scan_text(src).is_empty());
    }

    #[test]
    fn try_beyond_window_does_not_count() {
        let mut src = String::from("async function slow() {\n");
        for _ in 0..60 {
            src.push_str("  step();\n");
        }
        src.push_str("  try { x(); } catch (e) {}\n}\n");
        let bugs = scan_text(&src);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].line, 1);
    }

    #[test]
    fn async_arrow_is_also_checked() {
        let bugs = scan_text("const f = async () => {\n  await g();\n};\n");
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].message, "Async function has no try/catch");
    }

    #[test]
    fn async_must_be_a_whole_word() {
        let src = "makeasync(x);\nconst y = notasync (z);\nfooasync function bar() {}\n";
        assert!(scan_text(src).is_empty());
        let bugs = scan_text("run(async (x) => {\n  await x;\n});\n");
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].kind, BugType::MissingErrorHandling);
    }

    #[test]
    fn hardcoded_paths_one_bug_per_line() {
        let src = "const a = '/Users/me/x';\nconst b = '/Users/me/y' + 'C:\\\\tmp';\nconst c = './ok';\n";
        let bugs = scan_text(src);
        let lines: Vec<usize> = bugs.iter().map(|b| b.line).collect();
        assert_eq!(lines, vec![1, 2]);
        assert!(bugs.iter().all(|b| b.kind == BugType::HardcodedPath));
    }

    #[test]
    fn project_rules_match_their_patterns() {
        let src = "// local.set[0] expected type i32, found f64\nconst pass = test.currentlyFailing ? false : run();\n";
        let bugs = scan_text(src);
        assert_eq!(bugs.len(), 2);
        assert_eq!(bugs[0].kind, BugType::TypeMismatch);
        assert_eq!(bugs[0].severity, Severity::High);
        assert_eq!(bugs[0].message, "local.set expected i32, found f64");
        assert_eq!(bugs[1].kind, BugType::LogicError);
        assert_eq!(bugs[1].line, 2);
    }

    #[test]
    fn arbitrary_bytes_never_panic() {
        let scanner = Scanner::with_defaults(&ScanConfig::default());
        for text in ["", "import {", "import { } from ''", "async", "\u{0}\u{1}\n\n", "import { , } from 'x'"] {
            let _ = scanner.detect("x.js", text);
        }
    }

    #[test]
    fn identical_input_identical_findings() {
        let src = "import { a } from 'b';\nasync function f() {}\nconst p = '/Users/x';\n";
        let first: Vec<_> = scan_text(src)
            .iter()
            .map(|b| (b.kind, b.severity, b.file.clone(), b.line, b.message.clone()))
            .collect();
        let second: Vec<_> = scan_text(src)
            .iter()
            .map(|b| (b.kind, b.severity, b.file.clone(), b.line, b.message.clone()))
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn custom_detectors_can_be_registered() {
        struct Todo;
        impl Detector for Todo {
            fn name(&self) -> &'static str {
                "todo"
            }
            fn detect(&self, file: &str, content: &str) -> Vec<Bug> {
                content
                    .lines()
                    .enumerate()
                    .filter(|(_, l)| l.contains("TODO"))
                    .map(|(i, _)| {
                        bug(BugType::LogicError, Severity::Low, file, i + 1, "todo".into(), "TODO")
                    })
                    .collect()
            }
        }
        let mut scanner = Scanner::empty();
        scanner.register(Box::new(Todo));
        assert_eq!(scanner.detector_names(), vec!["todo"]);
        assert_eq!(scanner.detect("a.js", "x\n// TODO\n")[0].line, 2);
    }

    #[test]
    fn scan_walks_skips_binary_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "async function f() {}\n").unwrap();
        fs::write(dir.path().join("b.ts"), "const ok = 1;\n").unwrap();
        fs::write(dir.path().join("c.js"), b"\0\0binary").unwrap();
        fs::write(dir.path().join("notes.md"), "async function f() {}\n").unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/dep.js"), "async function f() {}\n").unwrap();

        let config = ScanConfig::default();
        let files = collect_files(&[dir.path().to_path_buf()], &config).unwrap();
        assert_eq!(files.len(), 3);

        let db = isolated_store();
        let session = db.client.session(Graph::Bugs).unwrap();
        let scanner = Scanner::with_defaults(&config);
        let report = scan(&scanner, &files, Some(&session), 2).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.bugs.len(), 1);
        assert_eq!(report.persisted, 1);

        let patterns = analyze_bug_patterns(&session).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, "MISSING_ERROR_HANDLING");
        assert_eq!(patterns[0].avg_line, 1.0);
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = collect_files(&[PathBuf::from("/no/such/dir")], &ScanConfig::default());
        assert!(err.is_err());
    }
}
