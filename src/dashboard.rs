use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::learning::{get_learning_stats, FixStats};
use crate::memory::memory_report;
use crate::model::{Bug, Record, Severity};
use crate::mutate_cmd::{analyze_mutation_score, MutationScore};
use crate::store::{Graph, GraphClient, GraphStore, Props, StoreError};

const TOP_RECOMMENDATIONS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct BugCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BugSection {
    pub by_type: Vec<BugCount>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySection {
    pub rules: usize,
    pub avg_confidence: f64,
    pub weak_spots: u64,
    pub fixed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: u8,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub bugs: BugSection,
    pub mutations: MutationScore,
    pub memory: MemorySection,
    pub fixes: FixStats,
    pub recommendations: Vec<Recommendation>,
}

pub fn bug_section(bugs: &dyn GraphStore) -> Result<BugSection, StoreError> {
    let by_type: Vec<BugCount> = bugs
        .aggregate(Bug::LABEL, &["type", "severity"], &Props::new(), None)?
        .into_iter()
        .map(|g| BugCount {
            kind: g.key_str(0).unwrap_or("UNKNOWN").to_string(),
            severity: g.key_str(1).unwrap_or("UNKNOWN").to_string(),
            count: g.count,
        })
        .collect();
    let total = by_type.iter().map(|b| b.count).sum();
    Ok(BugSection { by_type, total })
}

/// Collect every section. Each graph gets its own session.
pub fn collect(client: &GraphClient) -> Result<DashboardData> {
    let bugs = client.session(Graph::Bugs)?;
    let mutations = client.session(Graph::Mutations)?;
    let memory = client.session(Graph::Memory)?;

    let learning = get_learning_stats(&memory)?;
    let report = memory_report(&memory)?;

    Ok(DashboardData {
        bugs: bug_section(&bugs)?,
        mutations: analyze_mutation_score(&mutations)?,
        memory: MemorySection {
            rules: report.rules,
            avg_confidence: report.avg_confidence,
            weak_spots: learning.weak_spots.total,
            fixed: learning.weak_spots.fixed,
        },
        fixes: learning.fixes,
        recommendations: report
            .top_rules
            .into_iter()
            .take(TOP_RECOMMENDATIONS)
            .map(|r| Recommendation {
                kind: r.kind.to_string(),
                confidence: r.confidence,
                suggestion: r.suggestion,
            })
            .collect(),
    })
}

fn severity_marker(severity: &str) -> colored::ColoredString {
    match severity.parse::<Severity>() {
        Ok(Severity::High) => "●".red(),
        Ok(Severity::Medium) => "●".yellow(),
        _ => "●".green(),
    }
}

fn section(title: &str) {
    println!("{}", title.bold());
    println!("────────────────────────────────────────");
}

pub fn print_text(data: &DashboardData) {
    println!("{}", "kata dashboard".bold());
    println!("════════════════════════════════════════");
    println!();

    section("Bug detection");
    if data.bugs.by_type.is_empty() {
        println!("  No bugs detected yet");
    } else {
        for b in &data.bugs.by_type {
            println!(
                "  {} {:<24} {:<6} {}",
                severity_marker(&b.severity),
                b.kind,
                b.severity,
                b.count
            );
        }
        println!("  Total bugs: {}", data.bugs.total);
    }
    println!();

    section("Mutation testing");
    if data.mutations.total == 0 {
        println!("  No mutations tested yet");
    } else {
        println!("  Total mutations: {}", data.mutations.total);
        println!("  Killed:          {}", data.mutations.killed);
        println!("  Survived:        {}", data.mutations.survived);
        println!("  Kill rate:       {:.2}%", data.mutations.score);
    }
    println!();

    section("Memory");
    if data.memory.rules == 0 && data.memory.weak_spots == 0 {
        println!("  No learning data yet");
    } else {
        println!("  Rules learned:   {}", data.memory.rules);
        println!("  Avg confidence:  {:.2}%", data.memory.avg_confidence);
        println!("  Weak spots:      {}", data.memory.weak_spots);
        println!("  Fixed:           {}", data.memory.fixed);
    }
    println!();

    section("Learning loop");
    if data.fixes.total == 0 {
        println!("  No fixes recorded yet");
    } else {
        println!("  Fixes recorded:  {}", data.fixes.total);
        println!("  Successful:      {}", data.fixes.successful);
        println!("  Success rate:    {:.2}%", data.fixes.success_rate);
    }
    println!();

    section("Top recommendations");
    if data.recommendations.is_empty() {
        println!("  Run `kata scan` and `kata learn` first");
    } else {
        for r in &data.recommendations {
            println!("  {:>3}% {}", r.confidence, r.kind.cyan());
            if !r.suggestion.is_empty() {
                println!("       → {}", r.suggestion);
            }
        }
    }
}

pub fn print_json(data: &DashboardData) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::{log_fix_result, FixAttempt, FixOutcome};
    use crate::memory::{learn_from_bugs, learn_from_mutations};
    use crate::model::{BugType, MutationCategory, MutationOperator, MutationRecord};
    use crate::store::tests::isolated_store;
    use crate::store::RecordStore;

    fn bug(kind: BugType, severity: Severity, line: usize) -> Bug {
        Bug {
            kind,
            severity,
            file: "a.js".into(),
            line,
            message: "m".into(),
            suggestion: Some(kind.default_suggestion().into()),
            pattern: "p".into(),
            timestamp: 0,
        }
    }

    fn mutation(id: &str, survived: bool) -> MutationRecord {
        MutationRecord {
            id: id.into(),
            file: "a.js".into(),
            operator: MutationOperator::EqToNeq,
            category: MutationCategory::Comparison,
            original: "===".into(),
            mutated: "!==".into(),
            line: 1,
            survived,
            timestamp: 0,
        }
    }

    #[test]
    fn empty_store_gives_zeroed_sections() {
        let db = isolated_store();
        let data = collect(&db.client).unwrap();
        assert_eq!(data.bugs.total, 0);
        assert_eq!(data.mutations.total, 0);
        assert_eq!(data.mutations.score, 0.0);
        assert_eq!(data.memory.rules, 0);
        assert_eq!(data.fixes.total, 0);
        assert!(data.recommendations.is_empty());
    }

    #[test]
    fn sections_aggregate_every_graph() {
        let db = isolated_store();
        let bugs = db.client.session(Graph::Bugs).unwrap();
        let mutations = db.client.session(Graph::Mutations).unwrap();
        let memory = db.client.session(Graph::Memory).unwrap();

        let found = vec![
            bug(BugType::UnusedImport, Severity::Low, 1),
            bug(BugType::UnusedImport, Severity::Low, 2),
            bug(BugType::LogicError, Severity::High, 9),
        ];
        bugs.create_records(&found).unwrap();
        let runs = vec![
            mutation("m1", false),
            mutation("m2", false),
            mutation("m3", false),
            mutation("m4", true),
        ];
        mutations.create_records(&runs).unwrap();
        learn_from_bugs(&bugs, &memory).unwrap();
        learn_from_mutations(&mutations, &memory).unwrap();
        log_fix_result(
            &memory,
            &FixAttempt {
                kind: BugType::UnusedImport,
                file: Some("a.js".into()),
                description: "drop import".into(),
            },
            &FixOutcome {
                applied: true,
                error: None,
            },
        )
        .unwrap();

        let data = collect(&db.client).unwrap();
        assert_eq!(data.bugs.total, 3);
        assert_eq!(data.bugs.by_type[0].kind, "UNUSED_IMPORT");
        assert_eq!(data.bugs.by_type[0].count, 2);
        assert_eq!(data.mutations.total, 4);
        assert_eq!(data.mutations.killed, 3);
        assert_eq!(data.mutations.score, 75.0);
        assert_eq!(data.memory.rules, 2);
        assert_eq!(data.memory.weak_spots, 1);
        assert_eq!(data.memory.fixed, 0);
        assert_eq!(data.fixes.total, 1);
        assert_eq!(data.fixes.success_rate, 100.0);
        assert_eq!(data.recommendations.len(), 2);
        assert!(data.recommendations[0].confidence >= data.recommendations[1].confidence);

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["bugs"]["total"], 3);
        assert_eq!(json["memory"]["avgConfidence"], data.memory.avg_confidence);
        assert_eq!(json["recommendations"][0]["type"], data.recommendations[0].kind);
    }
}
