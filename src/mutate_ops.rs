//! Mutation operators and positional mutant generation.

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Range;

use crate::model::{now_millis, MutationCategory, MutationOperator, MutationRecord};
use crate::source_text::LineIndex;

/// Characters that glue into a single operator token (`>=`, `=>`, `++`, `//`).
const OPERATOR_CHARS: &[u8] = b"+-*/%=<>!&|^~?";

lazy_static! {
    static ref TRUE_RE: Regex = Regex::new(r"\btrue\b").unwrap();
    static ref FALSE_RE: Regex = Regex::new(r"\bfalse\b").unwrap();
    static ref ZERO_RE: Regex = Regex::new(r"\b0\b").unwrap();
    static ref ONE_RE: Regex = Regex::new(r"\b1\b").unwrap();
    static ref RETURN_RE: Regex = Regex::new(r"\breturn\s+[^;]+;").unwrap();
}

enum Matcher {
    /// A standalone operator token.
    Symbol(&'static str),
    Pattern(&'static Regex),
}

fn matcher(op: MutationOperator) -> (Matcher, &'static str) {
    use Matcher::{Pattern, Symbol};
    use MutationOperator::*;
    match op {
        AddToSub => (Symbol("+"), "-"),
        SubToAdd => (Symbol("-"), "+"),
        MulToDiv => (Symbol("*"), "/"),
        DivToMul => (Symbol("/"), "*"),
        EqToNeq => (Symbol("==="), "!=="),
        NeqToEq => (Symbol("!=="), "==="),
        GtToLt => (Symbol(">"), "<"),
        LtToGt => (Symbol("<"), ">"),
        GteToLte => (Symbol(">="), "<="),
        LteToGte => (Symbol("<="), ">="),
        AndToOr => (Symbol("&&"), "||"),
        OrToAnd => (Symbol("||"), "&&"),
        NegateRemove => (Symbol("!"), ""),
        TrueToFalse => (Pattern(&TRUE_RE), "false"),
        FalseToTrue => (Pattern(&FALSE_RE), "true"),
        ZeroToOne => (Pattern(&ZERO_RE), "1"),
        OneToZero => (Pattern(&ONE_RE), "0"),
        ReturnToNull => (Pattern(&RETURN_RE), "return null;"),
        ReturnToUndefined => (Pattern(&RETURN_RE), "return undefined;"),
    }
}

/// One candidate mutation: `span` of the pristine source replaced by
/// `mutated`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutant {
    pub id: String,
    pub file: String,
    pub operator: MutationOperator,
    pub original: String,
    pub mutated: String,
    pub line: usize,
    pub span: Range<usize>,
}

impl Mutant {
    pub fn category(&self) -> MutationCategory {
        self.operator.category()
    }

    /// The whole-file text with exactly this occurrence substituted.
    pub fn render(&self, source: &str) -> String {
        let mut out =
            String::with_capacity(source.len() - self.span.len() + self.mutated.len());
        out.push_str(&source[..self.span.start]);
        out.push_str(&self.mutated);
        out.push_str(&source[self.span.end..]);
        out
    }

    pub fn to_record(&self, survived: bool) -> MutationRecord {
        MutationRecord {
            id: self.id.clone(),
            file: self.file.clone(),
            operator: self.operator,
            category: self.category(),
            original: self.original.clone(),
            mutated: self.mutated.clone(),
            line: self.line,
            survived,
            timestamp: now_millis(),
        }
    }
}

/// Every mutant of `source` for the given operators, in operator order then
/// source order. Ids are `{file}_{OPERATOR}_{n}` with `n` counting from 1
/// per operator.
pub fn generate_mutants(file: &str, source: &str, operators: &[MutationOperator]) -> Vec<Mutant> {
    let lines = LineIndex::new(source);
    let mut mutants = Vec::new();
    for &op in operators {
        let (matcher, replacement) = matcher(op);
        let spans: Vec<Range<usize>> = match matcher {
            Matcher::Symbol(token) => symbol_spans(source, token),
            Matcher::Pattern(re) => re.find_iter(source).map(|m| m.range()).collect(),
        };
        for (idx, span) in spans.into_iter().enumerate() {
            mutants.push(Mutant {
                id: format!("{file}_{op}_{}", idx + 1),
                file: file.to_string(),
                operator: op,
                original: source[span.clone()].to_string(),
                mutated: replacement.to_string(),
                line: lines.line_of(span.start),
                span,
            });
        }
    }
    mutants
}

/// Occurrences of `token` that are a whole operator run on their own.
fn symbol_spans(source: &str, token: &str) -> Vec<Range<usize>> {
    let bytes = source.as_bytes();
    let is_op = |idx: usize| OPERATOR_CHARS.contains(&bytes[idx]);
    source
        .match_indices(token)
        .map(|(start, m)| start..start + m.len())
        .filter(|span| {
            let clean_before = span.start == 0 || !is_op(span.start - 1);
            let clean_after = span.end >= bytes.len() || !is_op(span.end);
            clean_before && clean_after
        })
        .collect()
}

/// Resolve `--operators` items. Each item is an operator name
/// (`EQ_TO_NEQ`) or a category (`comparison`). Empty means all.
pub fn select_operators(items: &[String]) -> Result<Vec<MutationOperator>> {
    if items.is_empty() {
        return Ok(MutationOperator::ALL.to_vec());
    }
    let mut wanted = Vec::new();
    for item in items.iter().flat_map(|s| s.split(',')).map(str::trim) {
        if item.is_empty() {
            continue;
        }
        if let Ok(op) = item.parse::<MutationOperator>() {
            wanted.push(op);
        } else if let Ok(cat) = item.parse::<MutationCategory>() {
            wanted.extend(
                MutationOperator::ALL
                    .into_iter()
                    .filter(|op| op.category() == cat),
            );
        } else {
            bail!("Unknown mutation operator or category: {item}");
        }
    }
    Ok(MutationOperator::ALL
        .into_iter()
        .filter(|op| wanted.contains(op))
        .collect())
}
