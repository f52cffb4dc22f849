//! Learning loop: fix outcomes move rule confidence, test results close
//! weak spots.

use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::memory::weak_spot_filter;
use crate::model::{
    adjust_confidence, format_millis, now_millis, BugType, FixResult, Record, Rule, WeakSpot,
    WeakSpotKey,
};
use crate::store::{filter, GraphStore, Props, RecordStore, StoreError};

pub const SUCCESS_DELTA: i32 = 2;
pub const FAILURE_DELTA: i32 = -5;

/// What was attempted.
#[derive(Debug, Clone)]
pub struct FixAttempt {
    pub kind: BugType,
    pub file: Option<String>,
    pub description: String,
}

/// What happened. `applied` with an `error` is a failed fix.
#[derive(Debug, Clone, Default)]
pub struct FixOutcome {
    pub applied: bool,
    pub error: Option<String>,
}

impl FixOutcome {
    pub fn success(&self) -> bool {
        self.applied && self.error.is_none()
    }
}

/// Append a FixResult and, for applied fixes, move the matching rule's
/// confidence (+2 on success, -5 on failure, clamped to 0..=100).
/// A missing rule is only a warning.
pub fn log_fix_result(
    memory: &dyn GraphStore,
    fix: &FixAttempt,
    outcome: &FixOutcome,
) -> Result<FixResult, StoreError> {
    let timestamp = now_millis();
    let result = FixResult {
        id: format!("fix_{}_{timestamp}", fix.kind),
        kind: fix.kind,
        file: fix.file.clone().unwrap_or_else(|| "unknown".to_string()),
        applied: outcome.applied,
        success: outcome.success(),
        timestamp,
        description: fix.description.clone(),
        error: outcome.error.clone(),
    };
    memory.create_record(&result)?;

    if !outcome.applied {
        return Ok(result);
    }
    let success = outcome.success();
    let updated = memory.update_records(
        &filter([("type", json!(fix.kind.as_str()))]),
        |rule: &mut Rule| {
            if success {
                rule.confidence = adjust_confidence(rule.confidence, SUCCESS_DELTA);
                rule.success_count += 1;
                rule.last_success = Some(timestamp);
            } else {
                rule.confidence = adjust_confidence(rule.confidence, FAILURE_DELTA);
                rule.failure_count += 1;
                rule.last_failure = Some(timestamp);
            }
        },
    )?;
    if updated == 0 {
        warn!(rule = %fix.kind, "no rule for fix result; confidence unchanged");
    } else if success {
        info!(rule = %fix.kind, "confidence increased");
    } else {
        info!(rule = %fix.kind, "confidence decreased");
    }
    Ok(result)
}

/// Record a test written for a weak spot. Only the spot with exactly this
/// `(file, line, operator)` changes; `fixedAt` is set when it is now fixed
/// and cleared otherwise. Returns how many spots matched.
pub fn log_test_improvement(
    memory: &dyn GraphStore,
    key: &WeakSpotKey,
    test_added: bool,
    test_passed: bool,
) -> Result<usize, StoreError> {
    let now = now_millis();
    let fixed = test_added && test_passed;
    let updated = memory.update_records(&weak_spot_filter(key), |spot: &mut WeakSpot| {
        spot.test_added = test_added;
        spot.test_passed = test_passed;
        spot.fixed = fixed;
        spot.fixed_at = fixed.then_some(now);
    })?;
    if updated == 0 {
        warn!(file = %key.file, line = key.line, operator = %key.operator, "no weak spot to update");
    }
    Ok(updated)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixStats {
    pub total: u64,
    pub successful: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfidence {
    #[serde(rename = "type")]
    pub kind: BugType,
    pub confidence: u8,
    pub success_count: u64,
    pub failure_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakSpotStats {
    pub total: u64,
    pub fixed: u64,
    pub fixed_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningStats {
    pub fixes: FixStats,
    pub rules: Vec<RuleConfidence>,
    pub weak_spots: WeakSpotStats,
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Read-only projection of the learning state.
pub fn get_learning_stats(memory: &dyn GraphStore) -> Result<LearningStats, StoreError> {
    let none = Props::new();
    let total = memory.count(FixResult::LABEL, &none)?;
    let successful = memory.count(FixResult::LABEL, &filter([("success", json!(true))]))?;

    let mut rules: Vec<RuleConfidence> = memory
        .match_records::<Rule>(&none)?
        .into_iter()
        .map(|r| RuleConfidence {
            kind: r.kind,
            confidence: r.confidence,
            success_count: r.success_count,
            failure_count: r.failure_count,
        })
        .collect();
    rules.sort_by(|a, b| b.confidence.cmp(&a.confidence));

    let spots = memory.count(WeakSpot::LABEL, &none)?;
    let fixed = memory.count(WeakSpot::LABEL, &filter([("fixed", json!(true))]))?;

    Ok(LearningStats {
        fixes: FixStats {
            total,
            successful,
            success_rate: rate(successful, total),
        },
        rules,
        weak_spots: WeakSpotStats {
            total: spots,
            fixed,
            fixed_rate: rate(fixed, spots),
        },
    })
}

pub fn print_learning_stats(stats: &LearningStats) {
    println!("{}", "Learning statistics".bold());
    println!("\nFix results:");
    println!("  attempted     {}", stats.fixes.total);
    println!("  successful    {}", stats.fixes.successful);
    println!("  success rate  {:.2}%", stats.fixes.success_rate);

    if !stats.rules.is_empty() {
        println!("\nRule confidence:");
        for r in &stats.rules {
            println!(
                "  {:<24} {:>3}%  ({} success, {} failures)",
                r.kind.as_str(),
                r.confidence,
                r.success_count,
                r.failure_count
            );
        }
    }

    println!("\nWeak spots:");
    println!("  total     {}", stats.weak_spots.total);
    println!("  fixed     {}", stats.weak_spots.fixed);
    println!("  fix rate  {:.2}%", stats.weak_spots.fixed_rate);
}

/// Fix results kept in an export.
pub const EXPORT_FIX_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningExport {
    pub timestamp: i64,
    pub exported_at: String,
    pub rules: Vec<Rule>,
    pub fixes: Vec<FixResult>,
    pub weak_spots: Vec<WeakSpot>,
}

/// All rules and weak spots, and the latest fix results newest first.
pub fn export_learning_data(memory: &dyn GraphStore) -> Result<LearningExport, StoreError> {
    let none = Props::new();
    let mut fixes: Vec<FixResult> = memory.match_records(&none)?;
    // stable sort: equal timestamps stay newest first
    fixes.reverse();
    fixes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    fixes.truncate(EXPORT_FIX_LIMIT);

    let timestamp = now_millis();
    Ok(LearningExport {
        timestamp,
        exported_at: format_millis(timestamp),
        rules: memory.match_records(&none)?,
        fixes,
        weak_spots: memory.match_records(&none)?,
    })
}

#[derive(Serialize)]
struct FixRow<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    file: &'a str,
    applied: bool,
    success: bool,
    timestamp: i64,
    description: &'a str,
    error: &'a str,
}

/// Fix results as CSV, one row per attempt.
pub fn write_fixes_csv<W: std::io::Write>(fixes: &[FixResult], out: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for fix in fixes {
        writer.serialize(FixRow {
            id: &fix.id,
            kind: fix.kind.as_str(),
            file: &fix.file,
            applied: fix.applied,
            success: fix.success,
            timestamp: fix.timestamp,
            description: &fix.description,
            error: fix.error.as_deref().unwrap_or(""),
        })?;
    }
    writer.flush()?;
    Ok(())
}
