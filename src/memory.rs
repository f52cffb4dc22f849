//! Knowledge store: turns raw bug and mutation history into Rules and
//! WeakSpots, and answers "what should I look at in this file" queries.

use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::model::{
    adjust_confidence, now_millis, Bug, BugType, MutationOperator, MutationRecord, Record, Rule,
    Severity, WeakSpot, WeakSpotKey, WeakSpotSeverity,
};
use crate::store::{filter, GraphStore, Props, RecordStore, StoreError};

/// New and refreshed records from one learning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearnReport {
    pub created: usize,
    pub updated: usize,
}

fn severity_weight(severity: Option<Severity>) -> f64 {
    severity.map(Severity::weight).unwrap_or(0.5)
}

/// `round(min(occurrences * 10, 70) + weight * 30)`, clamped to 0..=100.
pub fn initial_confidence(occurrences: u64, severity: Option<Severity>) -> u8 {
    let base = (occurrences.saturating_mul(10)).min(70) as f64;
    let raw = (base + severity_weight(severity) * 30.0).round() as i32;
    adjust_confidence(0, raw)
}

#[derive(Default)]
struct BugGroup {
    occurrences: u64,
    severities: BTreeMap<Severity, u64>,
    suggestions: BTreeMap<String, u64>,
}

impl BugGroup {
    /// Most frequent severity; ties go to the more severe one.
    fn dominant_severity(&self) -> Option<Severity> {
        self.severities
            .iter()
            .max_by_key(|(sev, count)| (**count, **sev))
            .map(|(sev, _)| *sev)
    }

    fn top_suggestion(&self) -> Option<&str> {
        self.suggestions
            .iter()
            .filter(|(s, _)| !s.trim().is_empty())
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(s, _)| s.as_str())
    }
}

/// One Rule per bug type, upserted by type. Existing rules keep their
/// learned confidence and counters.
pub fn learn_from_bugs(
    bugs: &dyn GraphStore,
    memory: &dyn GraphStore,
) -> Result<LearnReport, StoreError> {
    let mut groups: BTreeMap<BugType, BugGroup> = BTreeMap::new();
    let none = Props::new();

    for g in bugs.aggregate(Bug::LABEL, &["type", "severity"], &none, None)? {
        let Some(kind) = parse_key::<BugType>(g.key_str(0)) else {
            warn!(key = ?g.keys, "ignoring bugs with unknown type");
            continue;
        };
        let group = groups.entry(kind).or_default();
        group.occurrences += g.count;
        if let Some(sev) = parse_key::<Severity>(g.key_str(1)) {
            *group.severities.entry(sev).or_default() += g.count;
        }
    }
    for g in bugs.aggregate(Bug::LABEL, &["type", "suggestion"], &none, None)? {
        let (Some(kind), Some(text)) = (parse_key::<BugType>(g.key_str(0)), g.key_str(1)) else {
            continue;
        };
        if let Some(group) = groups.get_mut(&kind) {
            *group.suggestions.entry(text.to_string()).or_default() += g.count;
        }
    }

    let mut report = LearnReport::default();
    for (kind, group) in &groups {
        let severity = group.dominant_severity();
        let suggestion = group
            .top_suggestion()
            .unwrap_or(kind.default_suggestion())
            .to_string();
        let pattern = kind.rule_pattern().to_string();

        let updated = memory.update_records(
            &filter([("type", json!(kind.as_str()))]),
            |rule: &mut Rule| {
                rule.occurrences = group.occurrences;
                if let Some(sev) = severity {
                    rule.severity = sev;
                }
                rule.suggestion = suggestion.clone();
                rule.pattern = pattern.clone();
            },
        )?;
        if updated > 0 {
            report.updated += updated;
            continue;
        }

        let rule = Rule {
            id: format!("rule_{kind}"),
            kind: *kind,
            severity: severity.unwrap_or(Severity::Medium),
            occurrences: group.occurrences,
            suggestion,
            confidence: initial_confidence(group.occurrences, severity),
            pattern,
            success_count: 0,
            failure_count: 0,
            timestamp: now_millis(),
            last_success: None,
            last_failure: None,
        };
        debug!(rule = %rule.id, confidence = rule.confidence, "new rule");
        memory.create_record(&rule)?;
        report.created += 1;
    }
    Ok(report)
}

/// One WeakSpot per survived `(file, line, operator)`, upserted on that key.
/// Existing weak spots keep their test and fixed state.
pub fn learn_from_mutations(
    mutations: &dyn GraphStore,
    memory: &dyn GraphStore,
) -> Result<LearnReport, StoreError> {
    let groups = mutations.aggregate(
        MutationRecord::LABEL,
        &["file", "line", "operator", "category"],
        &filter([("survived", json!(true))]),
        None,
    )?;

    let mut report = LearnReport::default();
    for g in groups {
        let (Some(file), Some(line), Some(operator)) = (
            g.key_str(0),
            g.key_u64(1),
            parse_key::<MutationOperator>(g.key_str(2)),
        ) else {
            warn!(key = ?g.keys, "ignoring malformed mutation group");
            continue;
        };
        let key = WeakSpotKey {
            file: file.to_string(),
            line: line as usize,
            operator,
        };
        let severity = WeakSpotSeverity::from_count(g.count);
        let suggestion = operator.test_suggestion();

        let updated = memory.update_records(&weak_spot_filter(&key), |spot: &mut WeakSpot| {
            spot.count = g.count;
            spot.severity = severity;
            spot.suggestion = suggestion.clone();
        })?;
        if updated > 0 {
            report.updated += updated;
            continue;
        }

        memory.create_record(&WeakSpot {
            id: key.id(),
            file: key.file.clone(),
            line: key.line,
            operator,
            category: operator.category(),
            count: g.count,
            severity,
            suggestion,
            test_added: false,
            test_passed: false,
            fixed: false,
            fixed_at: None,
            timestamp: now_millis(),
        })?;
        report.created += 1;
    }
    Ok(report)
}

pub fn weak_spot_filter(key: &WeakSpotKey) -> Props {
    filter([
        ("file", json!(key.file)),
        ("line", json!(key.line)),
        ("operator", json!(key.operator.as_str())),
    ])
}

fn parse_key<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    raw.and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Recommendations {
    pub rules: Vec<Rule>,
    pub weak_spots: Vec<WeakSpot>,
}

/// Top five rules above 50 confidence, plus every weak spot in `file`.
pub fn get_recommendations(
    memory: &dyn GraphStore,
    file: &str,
) -> Result<Recommendations, StoreError> {
    let mut rules: Vec<Rule> = memory
        .match_records::<Rule>(&Props::new())?
        .into_iter()
        .filter(|r| r.confidence > 50)
        .collect();
    rules.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    rules.truncate(5);

    let mut weak_spots: Vec<WeakSpot> =
        memory.match_records(&filter([("file", json!(file))]))?;
    weak_spots.sort_by(|a, b| b.count.cmp(&a.count));

    Ok(Recommendations { rules, weak_spots })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoFix {
    #[serde(rename = "type")]
    pub kind: BugType,
    pub pattern: String,
    pub suggestion: String,
    pub confidence: u8,
    pub file: String,
}

/// Every rule whose pattern occurs literally in `content`, most confident
/// first. Substring matching only; false positives are expected.
pub fn generate_auto_fixes(
    memory: &dyn GraphStore,
    file: &str,
    content: &str,
) -> Result<Vec<AutoFix>, StoreError> {
    let mut rules: Vec<Rule> = memory.match_records(&Props::new())?;
    rules.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    Ok(rules
        .into_iter()
        .filter(|r| !r.pattern.is_empty() && content.contains(&r.pattern))
        .map(|r| AutoFix {
            kind: r.kind,
            pattern: r.pattern,
            suggestion: r.suggestion,
            confidence: r.confidence,
            file: file.to_string(),
        })
        .collect())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryReport {
    pub rules: usize,
    pub avg_confidence: f64,
    pub weak_spots: usize,
    pub top_rules: Vec<Rule>,
}

pub fn memory_report(memory: &dyn GraphStore) -> Result<MemoryReport, StoreError> {
    let mut rules: Vec<Rule> = memory.match_records(&Props::new())?;
    let weak_spots = memory.count(WeakSpot::LABEL, &Props::new())? as usize;
    let avg_confidence = if rules.is_empty() {
        0.0
    } else {
        rules.iter().map(|r| f64::from(r.confidence)).sum::<f64>() / rules.len() as f64
    };
    rules.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    let count = rules.len();
    rules.truncate(3);
    Ok(MemoryReport {
        rules: count,
        avg_confidence,
        weak_spots,
        top_rules: rules,
    })
}

pub fn print_recommendations(file: &str, recs: &Recommendations) {
    println!("{} {}", "recommendations for".bold(), file);
    if recs.rules.is_empty() && recs.weak_spots.is_empty() {
        println!("  nothing learned yet (run `kata learn`)");
        return;
    }
    for rule in &recs.rules {
        println!(
            "  [{:>3}%] {}: {}",
            rule.confidence,
            rule.kind.to_string().cyan(),
            rule.suggestion
        );
    }
    if !recs.weak_spots.is_empty() {
        println!("  weak spots:");
        for spot in &recs.weak_spots {
            let status = if spot.fixed { " (fixed)".green().to_string() } else { String::new() };
            println!(
                "    line {:<5} {:<20} x{} {}{}",
                spot.line,
                spot.operator.as_str(),
                spot.count,
                spot.suggestion,
                status
            );
        }
    }
}

pub fn print_auto_fixes(fixes: &[AutoFix]) {
    if fixes.is_empty() {
        println!("no rule patterns match this file");
        return;
    }
    for fix in fixes {
        println!(
            "[{:>3}%] {} (pattern {:?}): {}",
            fix.confidence, fix.kind, fix.pattern, fix.suggestion
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MutationCategory;
    use crate::store::tests::isolated_store;
    use crate::store::Graph;

    fn bug(kind: BugType, severity: Severity, suggestion: Option<&str>) -> Bug {
        Bug {
            kind,
            severity,
            file: "a.ts".into(),
            line: 1,
            message: "m".into(),
            suggestion: suggestion.map(String::from),
            pattern: String::new(),
            timestamp: 0,
        }
    }

    fn survived(file: &str, line: usize, operator: MutationOperator) -> MutationRecord {
        MutationRecord {
            id: format!("{file}_{operator}_1"),
            file: file.into(),
            operator,
            category: operator.category(),
            original: "true".into(),
            mutated: "false".into(),
            line,
            survived: true,
            timestamp: 0,
        }
    }

    #[test]
    fn confidence_formula() {
        assert_eq!(initial_confidence(1, Some(Severity::Low)), 22);
        assert_eq!(initial_confidence(3, Some(Severity::Medium)), 51);
        assert_eq!(initial_confidence(20, Some(Severity::High)), 100);
        assert_eq!(initial_confidence(2, None), 35);
    }

    #[test]
    fn rules_are_upserted_by_type_and_keep_learned_state() {
        let db = isolated_store();
        let bugs = db.client.session(Graph::Bugs).unwrap();
        let memory = db.client.session(Graph::Memory).unwrap();
        bugs.create_records(&[
            bug(BugType::UnusedImport, Severity::Low, Some("Remove it")),
            bug(BugType::HardcodedPath, Severity::Medium, None),
        ])
        .unwrap();

        let first = learn_from_bugs(&bugs, &memory).unwrap();
        assert_eq!(first, LearnReport { created: 2, updated: 0 });

        memory
            .update_records(&filter([("type", json!("UNUSED_IMPORT"))]), |r: &mut Rule| {
                r.confidence = 77;
                r.success_count = 4;
            })
            .unwrap();
        bugs.create_record(&bug(BugType::UnusedImport, Severity::Low, Some("Remove it")))
            .unwrap();

        let second = learn_from_bugs(&bugs, &memory).unwrap();
        assert_eq!(second, LearnReport { created: 0, updated: 2 });

        let rules: Vec<Rule> = memory
            .match_records(&filter([("type", json!("UNUSED_IMPORT"))]))
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].occurrences, 2);
        assert_eq!(rules[0].confidence, 77);
        assert_eq!(rules[0].success_count, 4);
        assert_eq!(rules[0].pattern, "import {");
        assert_eq!(rules[0].suggestion, "Remove it");
        assert_eq!(rules[0].id, "rule_UNUSED_IMPORT");
    }

    #[test]
    fn severity_vote_breaks_ties_upward() {
        let db = isolated_store();
        let bugs = db.client.session(Graph::Bugs).unwrap();
        let memory = db.client.session(Graph::Memory).unwrap();
        bugs.create_records(&[
            bug(BugType::LogicError, Severity::Low, None),
            bug(BugType::LogicError, Severity::High, None),
        ])
        .unwrap();
        learn_from_bugs(&bugs, &memory).unwrap();
        let rules: Vec<Rule> = memory.match_records(&Props::new()).unwrap();
        assert_eq!(rules[0].severity, Severity::High);
        // min(20, 70) + 1.0 * 30
        assert_eq!(rules[0].confidence, 50);
        assert_eq!(rules[0].suggestion, BugType::LogicError.default_suggestion());
    }

    #[test]
    fn weak_spots_aggregate_survivors_and_keep_test_state() {
        let db = isolated_store();
        let mutations = db.client.session(Graph::Mutations).unwrap();
        let memory = db.client.session(Graph::Memory).unwrap();
        let mut killed = survived("a.js", 3, MutationOperator::AddToSub);
        killed.survived = false;
        mutations
            .create_records(&[
                survived("a.js", 7, MutationOperator::TrueToFalse),
                survived("a.js", 7, MutationOperator::TrueToFalse),
                survived("b.js", 1, MutationOperator::GtToLt),
                killed,
            ])
            .unwrap();

        assert_eq!(
            learn_from_mutations(&mutations, &memory).unwrap(),
            LearnReport { created: 2, updated: 0 }
        );
        let key = WeakSpotKey {
            file: "a.js".into(),
            line: 7,
            operator: MutationOperator::TrueToFalse,
        };
        memory
            .update_records(&weak_spot_filter(&key), |w: &mut WeakSpot| {
                w.test_added = true;
            })
            .unwrap();

        for _ in 0..3 {
            mutations
                .create_record(&survived("a.js", 7, MutationOperator::TrueToFalse))
                .unwrap();
        }
        learn_from_mutations(&mutations, &memory).unwrap();

        let spots: Vec<WeakSpot> = memory.match_records(&weak_spot_filter(&key)).unwrap();
        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].count, 5);
        assert_eq!(spots[0].severity, WeakSpotSeverity::Critical);
        assert!(spots[0].test_added);
        assert_eq!(spots[0].id, "weak_a.js_7_TRUE_TO_FALSE");
        assert_eq!(spots[0].category, MutationCategory::Constant);
        assert_eq!(
            spots[0].suggestion,
            "Add test that verifies boolean true conditions"
        );

        let other: Vec<WeakSpot> = memory.match_records(&filter([("file", json!("b.js"))])).unwrap();
        assert_eq!(other[0].severity, WeakSpotSeverity::Low);
        assert_eq!(other[0].suggestion, "Add test for COMPARISON mutation");
    }

    fn seed_rule(memory: &dyn GraphStore, kind: BugType, confidence: u8) {
        memory
            .create_record(&Rule {
                id: format!("rule_{kind}"),
                kind,
                severity: Severity::Medium,
                occurrences: 1,
                suggestion: kind.default_suggestion().into(),
                confidence,
                pattern: kind.rule_pattern().into(),
                success_count: 0,
                failure_count: 0,
                timestamp: 0,
                last_success: None,
                last_failure: None,
            })
            .unwrap();
    }

    #[test]
    fn recommendations_filter_and_order() {
        let db = isolated_store();
        let memory = db.client.session(Graph::Memory).unwrap();
        seed_rule(&memory, BugType::UnusedImport, 40);
        seed_rule(&memory, BugType::HardcodedPath, 60);
        seed_rule(&memory, BugType::LogicError, 90);

        let recs = get_recommendations(&memory, "a.js").unwrap();
        let kinds: Vec<_> = recs.rules.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![BugType::LogicError, BugType::HardcodedPath]);
        assert!(recs.weak_spots.is_empty());
    }

    #[test]
    fn auto_fixes_are_substring_matches_by_confidence() {
        let db = isolated_store();
        let memory = db.client.session(Graph::Memory).unwrap();
        seed_rule(&memory, BugType::UnusedImport, 40);
        seed_rule(&memory, BugType::MissingErrorHandling, 80);
        seed_rule(&memory, BugType::HardcodedPath, 95);

        let content = "import { a } from 'b';\nasync function f() {}\n";
        let fixes = generate_auto_fixes(&memory, "x.js", content).unwrap();
        let kinds: Vec<_> = fixes.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![BugType::MissingErrorHandling, BugType::UnusedImport]
        );
        assert_eq!(fixes[0].file, "x.js");
    }

    #[test]
    fn report_summarizes_rules() {
        let db = isolated_store();
        let memory = db.client.session(Graph::Memory).unwrap();
        assert_eq!(memory_report(&memory).unwrap().rules, 0);
        seed_rule(&memory, BugType::UnusedImport, 40);
        seed_rule(&memory, BugType::LogicError, 60);
        let report = memory_report(&memory).unwrap();
        assert_eq!(report.rules, 2);
        assert_eq!(report.avg_confidence, 50.0);
        assert_eq!(report.top_rules[0].kind, BugType::LogicError);
    }
}
