//! Query relevance scoring for search-style results.
//!
//! A record scores `title_weight` per query token found in its title,
//! `body_weight` per token found in its body and `exact_bonus` when the
//! query appears verbatim in the title, unless it is a single token. Matching is
//! case-insensitive substring matching, counted once per distinct token
//! and field.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

/// Something with a title and a body to score.
pub trait Document {
    fn title(&self) -> Option<&str>;
    fn body(&self) -> Option<&str>;
}

const TITLE_KEYS: &[&str] = &["title", "job_title", "positionName", "name"];
const BODY_KEYS: &[&str] = &["body", "description", "job_description", "snippet"];

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// Provider rows: the first string field among the usual title/body names.
impl Document for Value {
    fn title(&self) -> Option<&str> {
        first_str(self, TITLE_KEYS)
    }

    fn body(&self) -> Option<&str> {
        first_str(self, BODY_KEYS)
    }
}

/// Scoring constants. The defaults are empirically chosen, not derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingWeights {
    pub title_weight: u32,
    pub body_weight: u32,
    pub exact_bonus: u32,
    /// Minimum score when the query has exactly one token
    pub single_token_threshold: u32,
    /// Minimum score otherwise
    pub multi_token_threshold: u32,
    /// Tokens this short or shorter are ignored
    pub min_token_len: usize,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            title_weight: 3,
            body_weight: 1,
            exact_bonus: 5,
            single_token_threshold: 1,
            multi_token_threshold: 2,
            min_token_len: 2,
        }
    }
}

/// A record with its relevance to `query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord<D> {
    pub record: D,
    pub score: u32,
    pub query: String,
}

impl ScoredRecord<Value> {
    /// The row with its score added as `relevance_score`.
    pub fn into_annotated(self) -> Value {
        let mut record = self.record;
        if let Value::Object(map) = &mut record {
            map.insert("relevance_score".into(), Value::from(self.score));
        }
        record
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelevanceRanker {
    weights: RankingWeights,
}

impl RelevanceRanker {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Distinct lowercase query tokens longer than `min_token_len`, in query order.
    pub fn tokenize(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        query
            .split_whitespace()
            .map(str::to_lowercase)
            .filter(|token| token.chars().count() > self.weights.min_token_len)
            .filter(|token| seen.insert(token.clone()))
            .collect()
    }

    /// Score of one record, before thresholding.
    pub fn score<D: Document + ?Sized>(&self, record: &D, query: &str, tokens: &[String]) -> u32 {
        let title = record.title().unwrap_or_default().to_lowercase();
        let body = record.body().unwrap_or_default().to_lowercase();
        let w = &self.weights;

        let title_hits = tokens.iter().filter(|t| title.contains(t.as_str())).count() as u32;
        let body_hits = tokens.iter().filter(|t| body.contains(t.as_str())).count() as u32;
        // A lone token is already counted by `title_hits`. Queries made only
        // of short words have no tokens and can score through the phrase alone.
        let query = query.trim().to_lowercase();
        let exact = tokens.len() != 1 && title.contains(&query);

        w.title_weight * title_hits + w.body_weight * body_hits + if exact { w.exact_bonus } else { 0 }
    }

    /// Keep the records relevant to `query`, best first.
    ///
    /// An empty query or record list comes back unchanged with every score 0.
    pub fn rank<D: Document>(&self, records: Vec<D>, query: &str) -> Vec<ScoredRecord<D>> {
        if query.trim().is_empty() || records.is_empty() {
            return records
                .into_iter()
                .map(|record| ScoredRecord {
                    record,
                    score: 0,
                    query: query.to_string(),
                })
                .collect();
        }

        let tokens = self.tokenize(query);
        let threshold = if tokens.len() == 1 {
            self.weights.single_token_threshold
        } else {
            self.weights.multi_token_threshold
        };

        let mut kept: Vec<ScoredRecord<D>> = records
            .into_iter()
            .filter_map(|record| {
                let mut score = self.score(&record, query, &tokens);
                if score < threshold {
                    // Only a record that scored nothing can be rescued, by a
                    // whole-word title hit, at score 1
                    if score > 0 || !has_title_word(&record, &tokens) {
                        return None;
                    }
                    score = 1;
                }
                Some(ScoredRecord {
                    record,
                    score,
                    query: query.to_string(),
                })
            })
            .collect();

        // Stable: ties keep input order
        kept.sort_by(|a, b| b.score.cmp(&a.score));
        kept
    }
}

fn has_title_word<D: Document + ?Sized>(record: &D, tokens: &[String]) -> bool {
    let title = record.title().unwrap_or_default().to_lowercase();
    title
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| !word.is_empty() && tokens.iter().any(|t| t == word))
}

/// Rank with the default weights.
pub fn rank<D: Document>(records: Vec<D>, query: &str) -> Vec<ScoredRecord<D>> {
    RelevanceRanker::default().rank(records, query)
}
