//! Inverted index over document terms with BM25 scoring.

use std::collections::{BTreeSet, HashMap};

use super::rank::TopicKeys;
use crate::document::tokenize;

pub(crate) type DocId = u64;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Term frequencies of one document. Title tokens are counted twice.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TermStats {
    pub(crate) freqs: HashMap<String, u32>,
    pub(crate) length: u32,
}

impl TermStats {
    pub(crate) fn of(title: &str, body: &str) -> Self {
        let mut stats = Self::default();
        let title_tokens = tokenize(title);
        for token in title_tokens.iter().chain(title_tokens.iter()).cloned().chain(tokenize(body)) {
            *stats.freqs.entry(token).or_default() += 1;
            stats.length += 1;
        }
        stats
    }
}

#[derive(Debug, Default)]
pub(crate) struct InvertedIndex {
    postings: HashMap<String, HashMap<DocId, u32>>,
    lengths: HashMap<DocId, u32>,
    total_length: u64,
}

/// Corpus-wide numbers BM25 needs, captured together with the candidates
/// so scoring can run after the index lock is released.
#[derive(Debug, Clone)]
pub(crate) struct CorpusStats {
    pub(crate) documents: usize,
    pub(crate) avg_length: f32,
    pub(crate) doc_freqs: HashMap<String, usize>,
}

impl InvertedIndex {
    pub(crate) fn insert(&mut self, id: DocId, stats: &TermStats) {
        for (term, tf) in &stats.freqs {
            self.postings.entry(term.clone()).or_default().insert(id, *tf);
        }
        if let Some(previous) = self.lengths.insert(id, stats.length) {
            self.total_length -= u64::from(previous);
        }
        self.total_length += u64::from(stats.length);
    }

    pub(crate) fn remove(&mut self, id: DocId, stats: &TermStats) {
        for term in stats.freqs.keys() {
            if let Some(docs) = self.postings.get_mut(term) {
                docs.remove(&id);
                if docs.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        if let Some(length) = self.lengths.remove(&id) {
            self.total_length -= u64::from(length);
        }
    }

    pub(crate) fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Documents containing any of `terms`, plus the statistics to score
    /// them. Only posting lists of the query terms are touched.
    pub(crate) fn candidates(&self, terms: &[String]) -> (Vec<DocId>, CorpusStats) {
        let mut ids = Vec::new();
        let mut doc_freqs = HashMap::new();
        for term in terms {
            if let Some(docs) = self.postings.get(term) {
                doc_freqs.insert(term.clone(), docs.len());
                ids.extend(docs.keys().copied());
            }
        }
        ids.sort_unstable();
        ids.dedup();

        let documents = self.lengths.len();
        let avg_length = if documents == 0 {
            0.0
        } else {
            self.total_length as f32 / documents as f32
        };
        (
            ids,
            CorpusStats {
                documents,
                avg_length,
                doc_freqs,
            },
        )
    }
}

impl CorpusStats {
    /// BM25 score of a document for the given (deduplicated) query terms.
    pub(crate) fn bm25(&self, terms: &[String], doc: &TermStats) -> f32 {
        let n = self.documents as f32;
        let length_norm = if self.avg_length > 0.0 {
            doc.length as f32 / self.avg_length
        } else {
            1.0
        };
        terms
            .iter()
            .filter_map(|term| {
                let tf = *doc.freqs.get(term)? as f32;
                let df = *self.doc_freqs.get(term)? as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                Some(idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * length_norm)))
            })
            .sum()
    }
}

/// Topic lookup for one tool: exact names and topic tokens to documents.
#[derive(Debug, Default)]
pub(crate) struct TopicIndex {
    names: HashMap<String, BTreeSet<DocId>>,
    tokens: HashMap<String, BTreeSet<DocId>>,
}

impl TopicIndex {
    pub(crate) fn insert(&mut self, id: DocId, keys: &TopicKeys) {
        for name in &keys.names {
            self.names.entry(name.clone()).or_default().insert(id);
        }
        for token in &keys.tokens {
            self.tokens.entry(token.clone()).or_default().insert(id);
        }
    }

    pub(crate) fn remove(&mut self, id: DocId, keys: &TopicKeys) {
        unlink(&mut self.names, &keys.names, id);
        unlink(&mut self.tokens, &keys.tokens, id);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.names.is_empty() && self.tokens.is_empty()
    }

    /// Documents an exact `name` picks out; when there are none, every
    /// document sharing at least one of `tokens`.
    pub(crate) fn candidates(&self, name: &str, tokens: &[String]) -> BTreeSet<DocId> {
        if let Some(exact) = self.names.get(name) {
            return exact.clone();
        }
        tokens
            .iter()
            .filter_map(|token| self.tokens.get(token))
            .flatten()
            .copied()
            .collect()
    }
}

fn unlink<'a>(
    postings: &mut HashMap<String, BTreeSet<DocId>>,
    keys: impl IntoIterator<Item = &'a String>,
    id: DocId,
) {
    for key in keys {
        if let Some(docs) = postings.get_mut(key) {
            docs.remove(&id);
            if docs.is_empty() {
                postings.remove(key);
            }
        }
    }
}
