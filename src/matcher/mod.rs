//! Two-phase signature matcher.
//!
//! Every pattern is compiled as a full regex. Where the regex has a finite
//! set of non-empty prefix literals, those literals go into one Aho-Corasick
//! automaton; a single pass over the text yields the patterns that can
//! possibly match, and only those regexes run. Patterns without usable
//! literals are always confirmed. The automaton only prunes, so results are
//! identical to running every regex over the text.

use std::collections::HashMap;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::Regex;
use regex_syntax::hir::literal::{ExtractKind, Extractor};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("invalid pattern #{index} '{pattern}': {source}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to build literal index: {source}")]
    Index {
        #[source]
        source: aho_corasick::BuildError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternMatch {
    pub pattern: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug)]
pub struct Matcher {
    regexes: Vec<Regex>,
    index: Option<AhoCorasick>,
    literal_owners: Vec<Vec<usize>>,
    always_check: Vec<usize>,
}

impl Matcher {
    pub fn build<I, S>(patterns: I) -> Result<Self, MatcherError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut regexes = Vec::new();
        let mut literal_ids: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut literals: Vec<Vec<u8>> = Vec::new();
        let mut literal_owners: Vec<Vec<usize>> = Vec::new();
        let mut always_check = Vec::new();

        for (index, pattern) in patterns.into_iter().enumerate() {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern).map_err(|e| MatcherError::InvalidPattern {
                index,
                pattern: pattern.to_string(),
                source: e,
            })?;
            regexes.push(regex);

            match prefix_literals(pattern) {
                Some(prefixes) => {
                    for lit in prefixes {
                        let id = *literal_ids.entry(lit.clone()).or_insert_with(|| {
                            literals.push(lit);
                            literal_owners.push(Vec::new());
                            literals.len() - 1
                        });
                        if literal_owners[id].last() != Some(&index) {
                            literal_owners[id].push(index);
                        }
                    }
                }
                None => always_check.push(index),
            }
        }

        let index = if literals.is_empty() {
            None
        } else {
            let ac = AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .prefilter(true)
                .build(&literals)
                .map_err(|e| MatcherError::Index { source: e })?;
            Some(ac)
        };

        debug!(
            patterns = regexes.len(),
            literals = literals.len(),
            always_check = always_check.len(),
            "built signature matcher"
        );

        Ok(Self {
            regexes,
            index,
            literal_owners,
            always_check,
        })
    }

    pub fn len(&self) -> usize {
        self.regexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }

    /// Patterns the literal pass could not prune.
    pub fn unindexed(&self) -> &[usize] {
        &self.always_check
    }

    pub fn candidates(&self, text: &str) -> Vec<usize> {
        let mut hit = vec![false; self.regexes.len()];
        for &p in &self.always_check {
            hit[p] = true;
        }
        if let Some(ac) = self.index.as_ref() {
            for m in ac.find_overlapping_iter(text) {
                for &p in &self.literal_owners[m.pattern().as_usize()] {
                    hit[p] = true;
                }
            }
        }
        hit.iter()
            .enumerate()
            .filter_map(|(i, h)| h.then_some(i))
            .collect()
    }

    /// Returns every (pattern, span) pair, ordered by pattern then position.
    pub fn query(&self, text: &str) -> Vec<PatternMatch> {
        let mut out = Vec::new();
        for pattern in self.candidates(text) {
            collect_matches(&self.regexes[pattern], pattern, text, &mut out);
        }
        out
    }

    /// Reference scan running every regex, used to check [`Matcher::query`].
    pub fn naive_query(&self, text: &str) -> Vec<PatternMatch> {
        let mut out = Vec::new();
        for (pattern, regex) in self.regexes.iter().enumerate() {
            collect_matches(regex, pattern, text, &mut out);
        }
        out
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.candidates(text)
            .into_iter()
            .any(|p| self.regexes[p].is_match(text))
    }
}

fn collect_matches(regex: &Regex, pattern: usize, text: &str, out: &mut Vec<PatternMatch>) {
    out.extend(regex.find_iter(text).map(|m| PatternMatch {
        pattern,
        start: m.start(),
        end: m.end(),
    }));
}

/// Finite set of literals one of which starts every match, if one exists.
fn prefix_literals(pattern: &str) -> Option<Vec<Vec<u8>>> {
    let hir = regex_syntax::Parser::new().parse(pattern).ok()?;
    let seq = Extractor::new().kind(ExtractKind::Prefix).extract(&hir);
    let lits = seq.literals()?;
    if lits.is_empty() || lits.iter().any(|l| l.as_bytes().is_empty()) {
        return None;
    }
    Some(lits.iter().map(|l| l.as_bytes().to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn reports_only_confirmed_matches() {
        let m = Matcher::build([r"Warning</b>: .* on line", r"ORA-\d{5}", "Stack trace:"]).unwrap();
        let text = "x ORA-12345 y ORA-1 <b>Warning</b>: foo on line 3";
        let got = m.query(text);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].pattern, 0);
        assert_eq!(got[1].pattern, 1);
        assert_eq!(&text[got[1].start..got[1].end], "ORA-12345");
        assert_eq!(got, m.naive_query(text));
    }

    #[test]
    fn literal_miss_prunes_pattern() {
        let m = Matcher::build([r"java\.lang\.\w+Exception", "Traceback"]).unwrap();
        assert!(m.unindexed().is_empty());
        assert!(m.candidates("nothing to see").is_empty());
        assert_eq!(m.candidates("a Traceback here"), vec![1]);
    }

    #[test]
    fn patterns_without_prefix_literals_are_always_checked() {
        let m = Matcher::build([r"\d+ errors?", "(?i)fatal", r"a*b"]).unwrap();
        assert!(m.unindexed().contains(&0));
        let text = "FATAL: 3 errors";
        assert_eq!(m.query(text), m.naive_query(text));
        assert!(m.is_match(text));
    }

    #[test]
    fn shared_literals_map_to_every_owner() {
        let m = Matcher::build(["error: a", "error: b", "error"]).unwrap();
        let got = m.query("error: b");
        let ids: Vec<usize> = got.iter().map(|pm| pm.pattern).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = Matcher::build(["ok", "(unclosed"]).unwrap_err();
        assert!(matches!(err, MatcherError::InvalidPattern { index: 1, .. }));
    }

    proptest! {
        #[test]
        fn query_equals_naive_scan(
            text in "[a-d0-9 .<>]{0,200}",
            patterns in proptest::collection::vec(
                prop_oneof![
                    "[a-d]{1,3}",
                    "[a-d]{1,2}[0-9]+",
                    "[0-9]\\.[a-d]*",
                    "<[a-d]+>",
                    "(ab|cd)[0-9]?",
                    "\\d{2,}",
                ],
                1..12,
            ),
        ) {
            let m = Matcher::build(&patterns).unwrap();
            prop_assert_eq!(m.query(&text), m.naive_query(&text));
        }
    }
}
