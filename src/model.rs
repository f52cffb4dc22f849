//! Record types persisted to the graph store, and the closed enumerations
//! (bug types, severities, mutation operators) they are built from.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Enumerations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    TypeMismatch,
    HardcodedPath,
    UnusedImport,
    MissingErrorHandling,
    LogicError,
}

impl BugType {
    pub const ALL: [BugType; 5] = [
        Self::TypeMismatch,
        Self::HardcodedPath,
        Self::UnusedImport,
        Self::MissingErrorHandling,
        Self::LogicError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::HardcodedPath => "HARDCODED_PATH",
            Self::UnusedImport => "UNUSED_IMPORT",
            Self::MissingErrorHandling => "MISSING_ERROR_HANDLING",
            Self::LogicError => "LOGIC_ERROR",
        }
    }

    pub fn default_suggestion(self) -> &'static str {
        match self {
            Self::TypeMismatch => "Check the declared type of the local before set/get/tee",
            Self::HardcodedPath => {
                "Use a path relative to the project root or an environment variable"
            }
            Self::UnusedImport => "Remove the unused import",
            Self::MissingErrorHandling => "Add try-catch block",
            Self::LogicError => "Compute actual pass result first, then check currentlyFailing",
        }
    }

    /// Literal text whose presence in a file makes a learned rule relevant.
    pub fn rule_pattern(self) -> &'static str {
        match self {
            Self::TypeMismatch => "local.",
            Self::HardcodedPath => "/Users/",
            Self::UnusedImport => "import {",
            Self::MissingErrorHandling => "async function",
            Self::LogicError => "currentlyFailing",
        }
    }
}

impl std::fmt::Display for BugType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BugType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown bug type: {s}"))
    }
}

/// Bug severity. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    /// Weight used by rule confidence scoring.
    pub fn weight(self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.7,
            Self::Low => 0.4,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => anyhow::bail!("Unknown severity: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeakSpotSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl WeakSpotSeverity {
    pub fn from_count(count: u64) -> Self {
        match count {
            c if c >= 5 => Self::Critical,
            c if c >= 3 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for WeakSpotSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationCategory {
    Arithmetic,
    Comparison,
    Logical,
    Constant,
    Return,
}

impl MutationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arithmetic => "ARITHMETIC",
            Self::Comparison => "COMPARISON",
            Self::Logical => "LOGICAL",
            Self::Constant => "CONSTANT",
            Self::Return => "RETURN",
        }
    }
}

impl std::fmt::Display for MutationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationCategory {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ARITHMETIC" => Ok(Self::Arithmetic),
            "COMPARISON" => Ok(Self::Comparison),
            "LOGICAL" => Ok(Self::Logical),
            "CONSTANT" => Ok(Self::Constant),
            "RETURN" => Ok(Self::Return),
            other => anyhow::bail!("Unknown mutation category: {other}"),
        }
    }
}

/// The closed mutation operator taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationOperator {
    AddToSub,
    SubToAdd,
    MulToDiv,
    DivToMul,
    EqToNeq,
    NeqToEq,
    GtToLt,
    LtToGt,
    GteToLte,
    LteToGte,
    AndToOr,
    OrToAnd,
    NegateRemove,
    TrueToFalse,
    FalseToTrue,
    ZeroToOne,
    OneToZero,
    ReturnToNull,
    ReturnToUndefined,
}

impl MutationOperator {
    /// Generation order: grouped by category, as listed in the taxonomy.
    pub const ALL: [MutationOperator; 19] = [
        Self::AddToSub,
        Self::SubToAdd,
        Self::MulToDiv,
        Self::DivToMul,
        Self::EqToNeq,
        Self::NeqToEq,
        Self::GtToLt,
        Self::LtToGt,
        Self::GteToLte,
        Self::LteToGte,
        Self::AndToOr,
        Self::OrToAnd,
        Self::NegateRemove,
        Self::TrueToFalse,
        Self::FalseToTrue,
        Self::ZeroToOne,
        Self::OneToZero,
        Self::ReturnToNull,
        Self::ReturnToUndefined,
    ];

    pub fn category(self) -> MutationCategory {
        match self {
            Self::AddToSub | Self::SubToAdd | Self::MulToDiv | Self::DivToMul => {
                MutationCategory::Arithmetic
            }
            Self::EqToNeq
            | Self::NeqToEq
            | Self::GtToLt
            | Self::LtToGt
            | Self::GteToLte
            | Self::LteToGte => MutationCategory::Comparison,
            Self::AndToOr | Self::OrToAnd | Self::NegateRemove => MutationCategory::Logical,
            Self::TrueToFalse | Self::FalseToTrue | Self::ZeroToOne | Self::OneToZero => {
                MutationCategory::Constant
            }
            Self::ReturnToNull | Self::ReturnToUndefined => MutationCategory::Return,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddToSub => "ADD_TO_SUB",
            Self::SubToAdd => "SUB_TO_ADD",
            Self::MulToDiv => "MUL_TO_DIV",
            Self::DivToMul => "DIV_TO_MUL",
            Self::EqToNeq => "EQ_TO_NEQ",
            Self::NeqToEq => "NEQ_TO_EQ",
            Self::GtToLt => "GT_TO_LT",
            Self::LtToGt => "LT_TO_GT",
            Self::GteToLte => "GTE_TO_LTE",
            Self::LteToGte => "LTE_TO_GTE",
            Self::AndToOr => "AND_TO_OR",
            Self::OrToAnd => "OR_TO_AND",
            Self::NegateRemove => "NEGATE_REMOVE",
            Self::TrueToFalse => "TRUE_TO_FALSE",
            Self::FalseToTrue => "FALSE_TO_TRUE",
            Self::ZeroToOne => "ZERO_TO_ONE",
            Self::OneToZero => "ONE_TO_ZERO",
            Self::ReturnToNull => "RETURN_TO_NULL",
            Self::ReturnToUndefined => "RETURN_TO_UNDEFINED",
        }
    }

    /// Test-writing hint for a weak spot left by this operator.
    pub fn test_suggestion(self) -> String {
        let hint = match self {
            Self::TrueToFalse => "Add test that verifies boolean true conditions",
            Self::FalseToTrue => "Add test that verifies boolean false conditions",
            Self::OneToZero => "Add test that checks for non-zero values",
            Self::ZeroToOne => "Add test that checks for zero values",
            Self::AddToSub => "Add test that verifies arithmetic addition",
            Self::SubToAdd => "Add test that verifies arithmetic subtraction",
            Self::EqToNeq => "Add test that verifies equality checks",
            Self::NeqToEq => "Add test that verifies inequality checks",
            Self::ReturnToNull => "Add test that checks return value is not null",
            Self::ReturnToUndefined => "Add test that checks return value is defined",
            other => return format!("Add test for {} mutation", other.category()),
        };
        hint.to_string()
    }
}

impl std::fmt::Display for MutationOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationOperator {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown mutation operator: {s}"))
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A persisted node type. `LABEL` is the node label in the graph store.
pub trait Record: Serialize + serde::de::DeserializeOwned {
    const LABEL: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bug {
    #[serde(rename = "type")]
    pub kind: BugType,
    pub severity: Severity,
    pub file: String,
    pub line: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Text that triggered the detector.
    #[serde(default)]
    pub pattern: String,
    pub timestamp: i64,
}

impl Record for Bug {
    const LABEL: &'static str = "Bug";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: String,
    pub file: String,
    pub operator: MutationOperator,
    pub category: MutationCategory,
    pub original: String,
    pub mutated: String,
    pub line: usize,
    pub survived: bool,
    pub timestamp: i64,
}

impl Record for MutationRecord {
    const LABEL: &'static str = "Mutation";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BugType,
    pub severity: Severity,
    pub occurrences: u64,
    pub suggestion: String,
    pub confidence: u8,
    pub pattern: String,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<i64>,
}

impl Record for Rule {
    const LABEL: &'static str = "Rule";
}

pub const MAX_CONFIDENCE: u8 = 100;

/// Apply `delta` to a confidence score, clamped to `0..=100`.
pub fn adjust_confidence(confidence: u8, delta: i32) -> u8 {
    (i32::from(confidence) + delta).clamp(0, i32::from(MAX_CONFIDENCE)) as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakSpot {
    pub id: String,
    pub file: String,
    pub line: usize,
    pub operator: MutationOperator,
    pub category: MutationCategory,
    pub count: u64,
    pub severity: WeakSpotSeverity,
    pub suggestion: String,
    #[serde(default)]
    pub test_added: bool,
    #[serde(default)]
    pub test_passed: bool,
    #[serde(default)]
    pub fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_at: Option<i64>,
    pub timestamp: i64,
}

impl Record for WeakSpot {
    const LABEL: &'static str = "WeakSpot";
}

/// Identity of a weak spot: `(file, line, operator)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeakSpotKey {
    pub file: String,
    pub line: usize,
    pub operator: MutationOperator,
}

impl WeakSpotKey {
    pub fn id(&self) -> String {
        format!("weak_{}_{}_{}", self.file, self.line, self.operator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BugType,
    pub file: String,
    pub applied: bool,
    pub success: bool,
    pub timestamp: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Record for FixResult {
    const LABEL: &'static str = "FixResult";
}

// ── Time ─────────────────────────────────────────────────────────────────────

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Render an epoch-millis timestamp as local `YYYY-MM-DD HH:MM`.
pub fn format_millis(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}
