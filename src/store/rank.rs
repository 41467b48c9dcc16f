//! Excerpts and topic matching used when presenting documents.

use std::cmp::Ordering;
use std::collections::HashSet;

use url::Url;

use crate::document::{Document, chunk_paragraphs, tokenize};

pub const EXCERPT_CHARS: usize = 400;

/// The body chunk with the most query-term hits, matches wrapped in `**`.
pub fn excerpt(body: &str, terms: &[String]) -> String {
    let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();
    let best = chunk_paragraphs(body, EXCERPT_CHARS)
        .into_iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            hits(a, &wanted)
                .cmp(&hits(b, &wanted))
                .then_with(|| ib.cmp(ia))
        })
        .map(|(_, chunk)| chunk);
    let Some(chunk) = best else {
        return String::new();
    };

    chunk
        .split_whitespace()
        .map(|word| highlight(word, &wanted))
        .collect::<Vec<_>>()
        .join(" ")
}

fn hits(chunk: &str, wanted: &HashSet<&str>) -> usize {
    tokenize(chunk)
        .iter()
        .filter(|token| wanted.contains(token.as_str()))
        .count()
}

fn highlight(word: &str, wanted: &HashSet<&str>) -> String {
    let start = word.find(|c: char| c.is_alphanumeric());
    let end = word.rfind(|c: char| c.is_alphanumeric());
    let (Some(start), Some(end)) = (start, end) else {
        return word.to_string();
    };
    let end = end + word[end..].chars().next().map_or(1, char::len_utf8);
    let core = &word[start..end];
    if wanted.contains(core.to_lowercase().as_str()) {
        format!("{}**{}**{}", &word[..start], core, &word[end..])
    } else {
        word.to_string()
    }
}

fn url_path(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

pub(crate) fn normalize_topic(text: &str) -> String {
    text.trim().trim_matches('/').to_lowercase()
}

/// Names and tokens a topic is matched against, computed once per stored
/// document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicKeys {
    /// Strings a topic may equal (case-insensitively) to name the document.
    pub names: Vec<String>,
    pub tokens: HashSet<String>,
}

impl TopicKeys {
    pub fn of(doc: &Document) -> Self {
        Self {
            names: exact_names(doc),
            tokens: topic_tokens(doc),
        }
    }
}

fn exact_names(doc: &Document) -> Vec<String> {
    let path = url_path(&doc.url);
    let last_segment = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let stem = last_segment
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| last_segment.clone());

    let mut names = vec![doc.url.clone(), path, last_segment, stem, doc.title.clone()];
    if !doc.section_path.is_empty() {
        names.push(doc.section_path.join("/"));
        names.push(doc.section_path.join(" > "));
        names.extend(doc.section_path.last().cloned());
    }
    let mut names: Vec<String> = names
        .iter()
        .map(|name| normalize_topic(name))
        .filter(|name| !name.is_empty())
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

fn topic_tokens(doc: &Document) -> HashSet<String> {
    tokenize(&doc.title)
        .into_iter()
        .chain(tokenize(&doc.section_path.join(" ")))
        .chain(tokenize(&url_path(&doc.url)))
        .collect()
}

/// Sørensen–Dice coefficient of two token sets.
pub fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    2.0 * shared as f32 / (a.len() + b.len()) as f32
}

fn newer_first(a: &Document, b: &Document) -> Ordering {
    b.fetched_at.cmp(&a.fetched_at).then_with(|| a.url.cmp(&b.url))
}

/// Picks the document `topic` names among `candidates`: an exact match on
/// url, path, title or section path wins; otherwise the best token overlap
/// at or above `threshold`.
pub fn match_topic<'a>(
    candidates: impl IntoIterator<Item = (&'a Document, &'a TopicKeys)>,
    topic: &str,
    threshold: f32,
) -> Option<&'a Document> {
    let wanted = normalize_topic(topic);
    if wanted.is_empty() {
        return None;
    }
    let candidates: Vec<(&Document, &TopicKeys)> = candidates.into_iter().collect();

    if let Some(exact) = candidates
        .iter()
        .filter(|(_, keys)| keys.names.contains(&wanted))
        .map(|(doc, _)| *doc)
        .min_by(|a, b| newer_first(a, b))
    {
        return Some(exact);
    }

    let topic_set: HashSet<String> = tokenize(topic).into_iter().collect();
    candidates
        .into_iter()
        .map(|(doc, keys)| (dice(&topic_set, &keys.tokens), doc))
        .filter(|(score, _)| *score >= threshold && *score > 0.0)
        .min_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| newer_first(a, b))
        })
        .map(|(_, doc)| doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn doc(url: &str, title: &str, section_path: &[&str]) -> Document {
        Document::new(
            "docs-a",
            url,
            title,
            "body",
            section_path.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_excerpt_picks_chunk_with_most_hits() {
        let body = format!(
            "{}\n\nRun the installer, then install the plugin.",
            "Unrelated opening paragraph. ".repeat(13)
        );
        let text = excerpt(&body, &terms(&["install", "installer"]));
        assert_eq!(text, "Run the **installer**, then **install** the plugin.");
    }

    #[test]
    fn test_excerpt_of_empty_body() {
        assert_eq!(excerpt("", &terms(&["x"])), "");
        assert_eq!(excerpt("no hits here", &terms(&["x"])), "no hits here");
    }

    /// Url of the document `topic` picks out of `docs`.
    fn pick(docs: &[Document], topic: &str, threshold: f32) -> Option<String> {
        let keys: Vec<TopicKeys> = docs.iter().map(TopicKeys::of).collect();
        match_topic(docs.iter().zip(&keys), topic, threshold).map(|doc| doc.url.clone())
    }

    #[test]
    fn test_exact_topic_matches() {
        let docs = vec![
            doc("https://docs.example/engine/install.html", "Install Docker Engine", &["Engine", "Install"]),
            doc("https://docs.example/compose/networking/", "Networking in Compose", &["Compose", "Networking"]),
        ];
        let install = Some("https://docs.example/engine/install.html".to_string());
        let networking = Some("https://docs.example/compose/networking/".to_string());
        assert_eq!(pick(&docs, "/engine/install.html", 0.5), install);
        assert_eq!(pick(&docs, "install", 0.5), install);
        assert_eq!(pick(&docs, "networking in compose", 0.5), networking);
        assert_eq!(pick(&docs, "Compose > Networking", 0.5), networking);
    }

    #[test]
    fn test_fuzzy_topic_respects_threshold() {
        let docs = vec![doc(
            "https://docs.example/compose/networking/",
            "Networking in Compose",
            &["Compose", "Networking"],
        )];
        assert!(pick(&docs, "compose networking overview", 0.5).is_some());
        assert!(pick(&docs, "kubernetes ingress controller", 0.5).is_none());
        assert!(pick(&docs, "   ", 0.0).is_none());
    }

    #[test]
    fn test_dice_coefficient() {
        let a: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert!((dice(&a, &b) - 0.5).abs() < f32::EPSILON);
        assert_eq!(dice(&a, &HashSet::new()), 0.0);
    }
}
