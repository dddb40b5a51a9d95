//! Artifact search
//!
//! Enumerates files across the chosen tiers (higher tiers shadow lower by
//! id), scores BM25-style over weighted metadata fields, and supports a
//! small query grammar: implicit AND, `OR`, `NOT`, quoted phrases with an
//! optional `~N` proximity window, `*` wildcards inside terms, and bounded
//! Levenshtein fuzzy matching when enabled.

use crate::resolver::Resolver;
use globset::{GlobBuilder, GlobMatcher};
use ryeos_core::{ArtifactId, ArtifactKind, Error, Result, Space, Version};
use serde::Serialize;
use tracing::debug;

const K1: f64 = 1.2;
const FIELD_WEIGHTS: &[(&str, f64)] = &[
    ("title", 3.0),
    ("name", 3.0),
    ("description", 2.0),
    ("category", 1.5),
    ("body", 1.0),
];

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub kinds: Vec<ArtifactKind>,
    pub space: Option<Space>,
    pub fuzzy: bool,
    pub page: usize,
    pub page_size: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            kinds: ArtifactKind::all().to_vec(),
            space: None,
            fuzzy: false,
            page: 0,
            page_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub kind: ArtifactKind,
    pub id: ArtifactId,
    pub space: Space,
    pub score: f64,
    pub title: String,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

pub struct Searcher<'a> {
    resolver: &'a Resolver,
}

struct Doc {
    kind: ArtifactKind,
    id: ArtifactId,
    space: Space,
    /// (weight, tokens) per scored field.
    fields: Vec<(f64, Vec<String>)>,
    title: String,
    preview: String,
    version: Option<Version>,
}

#[derive(Debug, PartialEq)]
enum Query {
    Term(String),
    Phrase { tokens: Vec<String>, window: Option<usize> },
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl<'a> Searcher<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self { resolver }
    }

    /// Run a query. Returns the page of hits plus the total match count.
    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<(Vec<SearchHit>, usize)> {
        let parsed = parse_query(query)?;
        let docs = self.collect_docs(opts);

        let mut scored: Vec<(f64, &Doc)> = Vec::new();
        for doc in &docs {
            if let Some(score) = score_query(&parsed, doc, &docs, opts.fuzzy) {
                if score > 0.0 {
                    scored.push((score, doc));
                }
            }
        }
        scored.sort_by(|(sa, da), (sb, db)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(db.space.rank().cmp(&da.space.rank()))
                .then(da.id.cmp(&db.id))
        });

        let total = scored.len();
        let page_size = opts.page_size.max(1);
        let hits = scored
            .into_iter()
            .skip(opts.page * page_size)
            .take(page_size)
            .map(|(score, doc)| SearchHit {
                kind: doc.kind,
                id: doc.id.clone(),
                space: doc.space.clone(),
                score,
                title: doc.title.clone(),
                preview: doc.preview.clone(),
                version: doc.version,
            })
            .collect();
        Ok((hits, total))
    }

    fn collect_docs(&self, opts: &SearchOptions) -> Vec<Doc> {
        let spaces = match &opts.space {
            Some(s) => vec![s.clone()],
            None => self.resolver.tiers.spaces(),
        };
        let mut docs = Vec::new();
        for kind in &opts.kinds {
            for (space, id, _path) in self.resolver.enumerate(*kind, &spaces) {
                // Unsigned or tampered artifacts never load, so they never
                // surface in search either.
                let artifact = match self.resolver.resolve(*kind, &id, Some(&space)) {
                    Ok(a) => a,
                    Err(e) => {
                        debug!(%id, error = %e, "skipping unloadable artifact in search");
                        continue;
                    }
                };
                let meta = &artifact.metadata;
                let title = meta
                    .get_str("title")
                    .or_else(|| meta.get_str("name"))
                    .unwrap_or(id.name())
                    .to_string();
                let description = meta.get_str("description").unwrap_or("").to_string();
                let preview_src = if description.is_empty() { &artifact.body } else { &description };
                let preview: String = preview_src.chars().take(160).collect();

                let fields = FIELD_WEIGHTS
                    .iter()
                    .map(|(field, weight)| {
                        let text = match *field {
                            "title" => meta.get_str("title").unwrap_or("").to_string(),
                            "name" => meta.get_str("name").unwrap_or(id.name()).to_string(),
                            "description" => description.clone(),
                            "category" => id.category().to_string(),
                            "body" => artifact.body.clone(),
                            _ => String::new(),
                        };
                        (*weight, tokenize(&text))
                    })
                    .collect();

                docs.push(Doc {
                    kind: *kind,
                    id,
                    space,
                    fields,
                    title,
                    preview,
                    version: artifact.version,
                });
            }
        }
        docs
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Grammar: `clause (OR clause)*`, clause = `[NOT] atom`+ (implicit AND),
/// atom = quoted phrase (optional `~N`) or bare term.
fn parse_query(query: &str) -> Result<Query> {
    let tokens = lex_query(query)?;
    if tokens.is_empty() {
        return Err(Error::validation("empty search query"));
    }
    let mut or_groups: Vec<Query> = Vec::new();
    let mut current: Vec<Query> = Vec::new();
    let mut negate_next = false;
    for tok in tokens {
        match tok {
            LexTok::Or => {
                if current.is_empty() {
                    return Err(Error::validation("OR with no left operand"));
                }
                or_groups.push(and_of(std::mem::take(&mut current)));
            }
            LexTok::And => {}
            LexTok::Not => negate_next = true,
            LexTok::Term(t) => {
                let atom = Query::Term(t.to_lowercase());
                current.push(wrap_not(atom, &mut negate_next));
            }
            LexTok::Phrase(text, window) => {
                let atom = Query::Phrase { tokens: tokenize(&text), window };
                current.push(wrap_not(atom, &mut negate_next));
            }
        }
    }
    if current.is_empty() {
        return Err(Error::validation("dangling OR in query"));
    }
    or_groups.push(and_of(current));
    Ok(if or_groups.len() == 1 {
        or_groups.pop().unwrap()
    } else {
        Query::Or(or_groups)
    })
}

fn wrap_not(atom: Query, negate: &mut bool) -> Query {
    if std::mem::take(negate) {
        Query::Not(Box::new(atom))
    } else {
        atom
    }
}

fn and_of(mut clauses: Vec<Query>) -> Query {
    if clauses.len() == 1 {
        clauses.pop().unwrap()
    } else {
        Query::And(clauses)
    }
}

enum LexTok {
    Term(String),
    Phrase(String, Option<usize>),
    And,
    Or,
    Not,
}

fn lex_query(query: &str) -> Result<Vec<LexTok>> {
    let mut out = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut phrase = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => phrase.push(ch),
                    None => return Err(Error::validation("unterminated quote in query")),
                }
            }
            // Optional proximity suffix: "a b"~4
            let mut window = None;
            if chars.peek() == Some(&'~') {
                chars.next();
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                window = digits.parse::<usize>().ok();
            }
            out.push(LexTok::Phrase(phrase, window));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '"' {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            match word.as_str() {
                "AND" => out.push(LexTok::And),
                "OR" => out.push(LexTok::Or),
                "NOT" => out.push(LexTok::Not),
                _ => out.push(LexTok::Term(word)),
            }
        }
    }
    Ok(out)
}

/// None means the doc is excluded (a NOT clause matched).
fn score_query(query: &Query, doc: &Doc, corpus: &[Doc], fuzzy: bool) -> Option<f64> {
    match query {
        Query::Term(term) => Some(score_term(term, doc, corpus, fuzzy)),
        Query::Phrase { tokens, window } => Some(score_phrase(tokens, *window, doc)),
        Query::Not(inner) => {
            let inner_score = score_query(inner, doc, corpus, fuzzy)?;
            if inner_score > 0.0 {
                None
            } else {
                Some(0.0)
            }
        }
        Query::And(clauses) => {
            let mut sum = 0.0;
            let mut matched_all = true;
            for clause in clauses {
                let s = score_query(clause, doc, corpus, fuzzy)?;
                // NOT clauses score 0 without failing the conjunction.
                if s <= 0.0 && !matches!(clause, Query::Not(_)) {
                    matched_all = false;
                }
                sum += s;
            }
            if matched_all {
                Some(sum)
            } else {
                Some(0.0)
            }
        }
        Query::Or(clauses) => {
            let mut best: f64 = 0.0;
            let mut excluded = true;
            for clause in clauses {
                if let Some(s) = score_query(clause, doc, corpus, fuzzy) {
                    excluded = false;
                    best = best.max(s);
                }
            }
            if excluded {
                None
            } else {
                Some(best)
            }
        }
    }
}

fn score_term(term: &str, doc: &Doc, corpus: &[Doc], fuzzy: bool) -> f64 {
    let wildcard = compile_wildcard(term);
    let mut weighted_tf = 0.0;
    for (weight, tokens) in &doc.fields {
        let tf = tokens
            .iter()
            .filter(|t| token_matches(term, t, wildcard.as_ref(), fuzzy))
            .count();
        weighted_tf += weight * tf as f64;
    }
    if weighted_tf == 0.0 {
        return 0.0;
    }
    let df = corpus
        .iter()
        .filter(|d| {
            d.fields.iter().any(|(_, toks)| {
                toks.iter().any(|t| token_matches(term, t, wildcard.as_ref(), fuzzy))
            })
        })
        .count() as f64;
    let n = corpus.len() as f64;
    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
    idf * (weighted_tf * (K1 + 1.0)) / (weighted_tf + K1)
}

/// Terms carrying `*`/`?` compile to a glob matcher once per term; a
/// malformed pattern falls back to literal matching.
fn compile_wildcard(term: &str) -> Option<GlobMatcher> {
    if !term.contains('*') && !term.contains('?') {
        return None;
    }
    GlobBuilder::new(term)
        .literal_separator(false)
        .build()
        .ok()
        .map(|g| g.compile_matcher())
}

fn token_matches(term: &str, token: &str, wildcard: Option<&GlobMatcher>, fuzzy: bool) -> bool {
    if let Some(matcher) = wildcard {
        return matcher.is_match(token);
    }
    if term == token {
        return true;
    }
    if fuzzy && term.len() >= 3 {
        let bound = if term.len() < 6 { 1 } else { 2 };
        return levenshtein_within(term, token, bound);
    }
    false
}

fn score_phrase(tokens: &[String], window: Option<usize>, doc: &Doc) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let mut score = 0.0;
    for (weight, field_tokens) in &doc.fields {
        let hits = match window {
            None => count_consecutive(tokens, field_tokens),
            Some(w) => count_within_window(tokens, field_tokens, w.max(tokens.len())),
        };
        score += weight * hits as f64;
    }
    score
}

fn count_consecutive(needle: &[String], haystack: &[String]) -> usize {
    if haystack.len() < needle.len() {
        return 0;
    }
    haystack
        .windows(needle.len())
        .filter(|w| w.iter().zip(needle).all(|(a, b)| a == b))
        .count()
}

/// All phrase tokens appear inside some window of the given width, in any
/// order.
fn count_within_window(needle: &[String], haystack: &[String], width: usize) -> usize {
    if haystack.len() < needle.len() {
        return 0;
    }
    let mut hits = 0;
    for start in 0..=haystack.len().saturating_sub(width.min(haystack.len())) {
        let end = (start + width).min(haystack.len());
        let slice = &haystack[start..end];
        if needle.iter().all(|n| slice.contains(n)) {
            hits += 1;
        }
    }
    hits
}

fn levenshtein_within(a: &str, b: &str, bound: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > bound {
        return false;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > bound {
            return false;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()] <= bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_grammar() {
        assert_eq!(parse_query("read files").unwrap(),
            Query::And(vec![Query::Term("read".into()), Query::Term("files".into())]));
        assert!(matches!(parse_query("read OR write").unwrap(), Query::Or(_)));
        assert!(matches!(parse_query("read NOT write").unwrap(), Query::And(_)));
        assert_eq!(parse_query("\"read file\"~3").unwrap(),
            Query::Phrase { tokens: vec!["read".into(), "file".into()], window: Some(3) });
        assert!(parse_query("").is_err());
        assert!(parse_query("\"open").is_err());
    }

    #[test]
    fn levenshtein_bounds() {
        assert!(levenshtein_within("read", "reed", 1));
        assert!(!levenshtein_within("read", "write", 2));
        assert!(levenshtein_within("search", "serch", 2));
    }

    #[test]
    fn wildcard_tokens() {
        let matches = |term: &str, token: &str| {
            token_matches(term, token, compile_wildcard(term).as_ref(), false)
        };
        assert!(matches("read*", "reader"));
        assert!(matches("read*", "read"));
        assert!(!matches("read*", "bread"));
        assert!(matches("r??d", "read"));
    }

    #[test]
    fn consecutive_and_windowed_phrases() {
        let hay = tokenize("read the file then write the file");
        assert_eq!(count_consecutive(&tokenize("the file"), &hay), 2);
        assert_eq!(count_consecutive(&tokenize("file read"), &hay), 0);
        assert!(count_within_window(&tokenize("read write"), &hay, 7) > 0);
        assert_eq!(count_within_window(&tokenize("read write"), &hay, 3), 0);
    }
}
