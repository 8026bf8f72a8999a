//! Inverted full-text index: tokenizer, forward/inverted maps, and
//! term/AND/OR/phrase/prefix/proximity/ranked search.
//!
//! No example repo in the retrieval pack implements an inverted index, so
//! this module is built directly from the tokenize → forward-index →
//! inverted-index → scoring pipeline general-purpose search engines use,
//! expressed in the same struct-with-`thiserror`-free-operations style the
//! ordered/hash indexes in this crate use.
use std::collections::{BTreeMap, HashMap};

use super::IndexKind;

#[derive(Debug, Clone)]
pub struct FullTextConfig {
    pub min_token_length: usize,
    pub max_token_length: usize,
    pub case_sensitive: bool,
    /// Characters treated as token separators; anything not alphanumeric by
    /// default.
    pub separators: Vec<char>,
    pub stop_words: std::collections::HashSet<String>,
    pub enable_positions: bool,
}

impl Default for FullTextConfig {
    fn default() -> Self {
        Self {
            min_token_length: 1,
            max_token_length: 64,
            case_sensitive: false,
            separators: Vec::new(),
            stop_words: std::collections::HashSet::new(),
            enable_positions: true,
        }
    }
}

impl FullTextConfig {
    fn is_separator(&self, c: char) -> bool {
        if self.separators.is_empty() {
            !c.is_alphanumeric()
        } else {
            self.separators.contains(&c)
        }
    }

    /// Splits `text` into normalized tokens, filtering by length and
    /// stop-words. Positions are contiguous indices over the retained
    /// tokens, assigned after filtering.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let normalized = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        normalized
            .split(|c: char| self.is_separator(c))
            .filter(|token| !token.is_empty())
            .filter(|token| {
                token.chars().count() >= self.min_token_length
                    && token.chars().count() <= self.max_token_length
            })
            .filter(|token| !self.stop_words.contains(*token))
            .map(|token| token.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Posting {
    positions: Vec<usize>,
}

impl Posting {
    fn term_frequency(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug)]
pub struct FullTextIndex {
    field: String,
    config: FullTextConfig,
    /// term -> (entity-id -> posting)
    inverted: BTreeMap<String, HashMap<String, Posting>>,
    /// entity-id -> retained token list, for O(tokens) removal.
    forward: HashMap<String, Vec<String>>,
}

impl FullTextIndex {
    pub fn new(field: impl Into<String>, config: FullTextConfig) -> Self {
        Self {
            field: field.into(),
            config,
            inverted: BTreeMap::new(),
            forward: HashMap::new(),
        }
    }

    pub fn kind(&self) -> IndexKind {
        IndexKind::FullText
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn config(&self) -> &FullTextConfig {
        &self.config
    }

    pub fn document_count(&self) -> usize {
        self.forward.len()
    }

    pub fn cardinality(&self) -> usize {
        self.inverted.len()
    }

    pub fn total_entries(&self) -> usize {
        self.inverted.values().map(|p| p.len()).sum()
    }

    pub fn insert(&mut self, id: &str, text: &str) {
        self.remove(id);
        let tokens = self.config.tokenize(text);
        if tokens.is_empty() {
            return;
        }
        for (position, token) in tokens.iter().enumerate() {
            let posting = self
                .inverted
                .entry(token.clone())
                .or_default()
                .entry(id.to_string())
                .or_default();
            if self.config.enable_positions {
                posting.positions.push(position);
            } else {
                // No positions tracked, but `term_frequency` still reads
                // `positions.len()` — keep a single placeholder slot per
                // occurrence instead of real offsets.
                posting.positions.push(0);
            }
        }
        self.forward.insert(id.to_string(), tokens);
    }

    /// Removes `id` using the forward index to find affected terms in one
    /// pass, pruning any term whose posting set becomes empty.
    pub fn remove(&mut self, id: &str) {
        let Some(tokens) = self.forward.remove(id) else {
            return;
        };
        let mut touched: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for token in &tokens {
            touched.insert(token.as_str());
        }
        for token in touched {
            if let Some(postings) = self.inverted.get_mut(token) {
                postings.remove(id);
                if postings.is_empty() {
                    self.inverted.remove(token);
                }
            }
        }
    }

    fn normalize_term(&self, term: &str) -> String {
        if self.config.case_sensitive {
            term.to_string()
        } else {
            term.to_lowercase()
        }
    }

    pub fn term(&self, term: &str) -> Vec<String> {
        let term = self.normalize_term(term);
        self.inverted
            .get(&term)
            .map(|postings| postings.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_terms(&self, terms: &[String]) -> Vec<String> {
        if terms.is_empty() {
            return Vec::new();
        }
        let mut sets = terms.iter().map(|t| self.id_set(t));
        let Some(first) = sets.next() else {
            return Vec::new();
        };
        let mut acc = first;
        for set in sets {
            acc.retain(|id| set.contains(id));
        }
        let mut ids: Vec<String> = acc.into_iter().collect();
        ids.sort();
        ids
    }

    pub fn any_term(&self, terms: &[String]) -> Vec<String> {
        let mut union = std::collections::HashSet::new();
        for term in terms {
            union.extend(self.id_set(term));
        }
        let mut ids: Vec<String> = union.into_iter().collect();
        ids.sort();
        ids
    }

    fn id_set(&self, term: &str) -> std::collections::HashSet<String> {
        let term = self.normalize_term(term);
        self.inverted
            .get(&term)
            .map(|postings| postings.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Requires position tracking. For each AND-candidate id, checks that a
    /// starting position `p` for the first term has `p+i` present in the
    /// i-th term's posting for all `i > 0`.
    pub fn phrase(&self, phrase: &str) -> Vec<String> {
        let terms = self.config.tokenize(phrase);
        if terms.is_empty() || !self.config.enable_positions {
            return Vec::new();
        }
        let candidates = self.all_terms(&terms);
        let mut matches = Vec::new();
        'candidate: for id in candidates {
            let Some(first_positions) = self.positions_for(&terms[0], &id) else {
                continue;
            };
            for &p in &first_positions {
                let mut aligned = true;
                for (i, term) in terms.iter().enumerate().skip(1) {
                    let Some(positions) = self.positions_for(term, &id) else {
                        aligned = false;
                        break;
                    };
                    if !positions.contains(&(p + i)) {
                        aligned = false;
                        break;
                    }
                }
                if aligned {
                    matches.push(id);
                    continue 'candidate;
                }
            }
        }
        matches
    }

    fn positions_for(&self, term: &str, id: &str) -> Option<Vec<usize>> {
        let term = self.normalize_term(term);
        self.inverted
            .get(&term)
            .and_then(|postings| postings.get(id))
            .map(|posting| posting.positions.clone())
    }

    pub fn prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = self.normalize_term(prefix);
        let mut union = std::collections::HashSet::new();
        for (term, postings) in self.inverted.range(prefix.clone()..) {
            if !term.starts_with(&prefix) {
                break;
            }
            union.extend(postings.keys().cloned());
        }
        let mut ids: Vec<String> = union.into_iter().collect();
        ids.sort();
        ids
    }

    /// For each AND-candidate id, slides pointers across each term's sorted
    /// position list, always advancing the minimum pointer, and accepts when
    /// the spread between the farthest and nearest pointer is within
    /// `max_distance`.
    pub fn proximity(&self, terms: &[String], max_distance: usize) -> Vec<String> {
        if terms.len() < 2 || !self.config.enable_positions {
            return Vec::new();
        }
        let candidates = self.all_terms(terms);
        let mut matches = Vec::new();
        for id in candidates {
            let lists: Option<Vec<Vec<usize>>> =
                terms.iter().map(|t| self.positions_for(t, &id)).collect();
            let Some(lists) = lists else { continue };
            if lists.iter().any(|l| l.is_empty()) {
                continue;
            }
            if within_proximity(&lists, max_distance) {
                matches.push(id);
            }
        }
        matches.sort();
        matches
    }

    /// TF-IDF-flavored ranking: `score = sum_t (1 + log2(tf)) * clamp(log2(N/df), 0, 100)`.
    pub fn ranked(&self, terms: &[String]) -> Vec<(String, f64)> {
        let total_docs = self.document_count().max(1) as f64;
        let mut scores: HashMap<String, f64> = HashMap::new();
        for term in terms {
            let normalized = self.normalize_term(term);
            let Some(postings) = self.inverted.get(&normalized) else {
                continue;
            };
            let df = postings.len().max(1) as f64;
            let idf = (total_docs / df).log2().clamp(0.0, 100.0);
            for (id, posting) in postings {
                let tf = posting.term_frequency().max(1) as f64;
                let contribution = (1.0 + tf.log2()) * idf;
                *scores.entry(id.clone()).or_insert(0.0) += contribution;
            }
        }
        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    pub fn to_map(&self) -> FullTextSnapshot {
        FullTextSnapshot {
            forward: self.forward.clone(),
            inverted: self
                .inverted
                .iter()
                .map(|(term, postings)| {
                    (
                        term.clone(),
                        postings
                            .iter()
                            .map(|(id, posting)| (id.clone(), posting.positions.clone()))
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn from_map(field: impl Into<String>, config: FullTextConfig, snapshot: FullTextSnapshot) -> Self {
        let inverted = snapshot
            .inverted
            .into_iter()
            .map(|(term, postings)| {
                let postings = postings
                    .into_iter()
                    .map(|(id, positions)| (id, Posting { positions }))
                    .collect();
                (term, postings)
            })
            .collect();
        Self {
            field: field.into(),
            config,
            inverted,
            forward: snapshot.forward,
        }
    }
}

fn within_proximity(lists: &[Vec<usize>], max_distance: usize) -> bool {
    let mut pointers = vec![0usize; lists.len()];
    loop {
        let current: Vec<usize> = lists
            .iter()
            .zip(pointers.iter())
            .map(|(list, &p)| list[p])
            .collect();
        let min = *current.iter().min().unwrap();
        let max = *current.iter().max().unwrap();
        if max - min <= max_distance {
            return true;
        }
        let min_idx = current
            .iter()
            .enumerate()
            .min_by_key(|&(_, &v)| v)
            .map(|(i, _)| i)
            .unwrap();
        pointers[min_idx] += 1;
        if pointers[min_idx] >= lists[min_idx].len() {
            return false;
        }
    }
}

/// Serializable form of a [`FullTextIndex`]'s state, used by
/// [`super::persistence::IndexPersistence`].
#[derive(Debug, Clone, Default)]
pub struct FullTextSnapshot {
    pub forward: HashMap<String, Vec<String>>,
    pub inverted: BTreeMap<String, HashMap<String, Vec<usize>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FullTextIndex {
        let mut index = FullTextIndex::new("content", FullTextConfig::default());
        index.insert("doc-1", "The quick brown fox");
        index.insert("doc-2", "A lazy brown dog");
        index
    }

    #[test]
    fn term_frequency_accumulates_without_positions() {
        let config = FullTextConfig {
            enable_positions: false,
            ..FullTextConfig::default()
        };
        let mut index = FullTextIndex::new("content", config);
        index.insert("doc-1", "foo foo foo bar");

        let postings = index.inverted.get("foo").unwrap();
        assert_eq!(postings.get("doc-1").unwrap().term_frequency(), 3);
        let postings = index.inverted.get("bar").unwrap();
        assert_eq!(postings.get("doc-1").unwrap().term_frequency(), 1);
    }

    #[test]
    fn term_search_finds_both_documents() {
        let index = index();
        let mut ids = index.term("brown");
        ids.sort();
        assert_eq!(ids, vec!["doc-1", "doc-2"]);
    }

    #[test]
    fn phrase_search_matches_only_adjacent_terms() {
        let index = index();
        assert_eq!(index.phrase("quick brown"), vec!["doc-1"]);
        assert!(index.phrase("brown quick").is_empty());
    }

    #[test]
    fn prefix_search_unions_matching_vocabulary() {
        let index = index();
        let mut ids = index.prefix("fo");
        ids.sort();
        assert_eq!(ids, vec!["doc-1"]);
    }

    #[test]
    fn empty_query_returns_empty() {
        let index = index();
        assert!(index.term("").is_empty());
        assert!(index.phrase("").is_empty());
    }

    #[test]
    fn remove_then_remove_again_is_a_noop() {
        let mut index = index();
        index.remove("doc-1");
        assert!(index.term("quick").is_empty());
        index.remove("doc-1");
        assert!(index.term("brown") == vec!["doc-2"]);
    }

    #[test]
    fn ranked_orders_by_descending_score() {
        let mut index = FullTextIndex::new("content", FullTextConfig::default());
        index.insert("doc-1", "rust rust rust database");
        index.insert("doc-2", "rust cooking");
        let ranked = index.ranked(&["rust".to_string()]);
        assert_eq!(ranked[0].0, "doc-1");
    }

    #[test]
    fn proximity_respects_max_distance() {
        let mut index = FullTextIndex::new("content", FullTextConfig::default());
        index.insert("doc-1", "alpha beta gamma delta epsilon rust");
        let close = index.proximity(&["alpha".into(), "beta".into()], 2);
        assert_eq!(close, vec!["doc-1"]);
        let far = index.proximity(&["alpha".into(), "rust".into()], 1);
        assert!(far.is_empty());
    }
}
