//! Narration similarity scoring.
//!
//! The score is the larger of two views of the same pair of narrations:
//! a Sørensen–Dice coefficient over normalized token sets (robust to word
//! order and extra words) and a normalized Levenshtein similarity over the
//! sorted token strings (robust to typos). Both are computed on lowercase
//! alphanumeric tokens, so case, punctuation and whitespace never matter.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static TOKEN_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid token pattern"));

/// Similarity of two narrations in `[0, 1]`, rounded to four decimals.
///
/// Identical narrations (after normalization) score 1.0; narrations that
/// share no tokens and few characters score close to 0.
pub fn narration_similarity(a: &str, b: &str) -> f64 {
    let left = tokenize(a);
    let right = tokenize(b);

    let raw = match (left.is_empty(), right.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => dice_coefficient(&left, &right).max(edit_similarity(&left, &right)),
    };

    round4(raw)
}

fn tokenize(s: &str) -> BTreeSet<String> {
    TOKEN_SPLIT
        .split(&s.to_lowercase())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn dice_coefficient(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let shared = a.intersection(b).count();
    (2 * shared) as f64 / (a.len() + b.len()) as f64
}

fn edit_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let left: Vec<char> = join_tokens(a).chars().collect();
    let right: Vec<char> = join_tokens(b).chars().collect();
    let max_len = left.len().max(right.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&left, &right) as f64 / max_len as f64
}

fn join_tokens(tokens: &BTreeSet<String>) -> String {
    tokens.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

/// Classic two-row Levenshtein distance over chars.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
