use crate::utils::encoding::{decode_latin1, TextEncoding};
use crate::utils::error::Result;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

pub const MAX_SUGGESTIONS: usize = 5;
pub const MAX_EDIT_DISTANCE: usize = 2;

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-zÀ-ÖØ-öø-ÿ]+(?:'[A-Za-zÀ-ÖØ-öø-ÿ]+)*").unwrap()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misspelling {
    pub word: String,
    /// Byte offset into the checked text.
    pub offset: usize,
    pub suggestions: Vec<String>,
}

/// A plain word list. Lookups ignore case.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    words: BTreeSet<String>,
}

impl Dictionary {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dictionary = Self::default();
        for word in words {
            dictionary.add_word(word.as_ref());
        }
        dictionary
    }

    /// One word per line; blank lines and `#` comments are skipped. Lists
    /// that are not valid UTF-8 are read as ISO-8859-1.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let text = TextEncoding::Utf8
            .decode(&bytes)
            .unwrap_or_else(|_| decode_latin1(&bytes));
        let dictionary = Self::from_words(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        );
        tracing::debug!(
            "Loaded {} dictionary words from {}",
            dictionary.len(),
            path.display()
        );
        Ok(dictionary)
    }

    pub fn add_word(&mut self, word: &str) {
        let word = word.trim();
        if !word.is_empty() {
            self.words.insert(word.to_lowercase());
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, word: &str) -> bool {
        let lower = word.to_lowercase();
        if self.words.contains(&lower) {
            return true;
        }
        lower
            .strip_suffix("'s")
            .is_some_and(|stem| self.words.contains(stem))
    }

    /// Closest words within [`MAX_EDIT_DISTANCE`], nearest first and
    /// alphabetical within a distance.
    pub fn suggest(&self, word: &str) -> Vec<String> {
        let lower = word.to_lowercase();
        let mut scored: Vec<(usize, &String)> = self
            .words
            .iter()
            .map(|candidate| (strsim::levenshtein(&lower, candidate), candidate))
            .filter(|(distance, _)| *distance <= MAX_EDIT_DISTANCE)
            .collect();
        scored.sort();
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, w)| w.clone())
            .collect()
    }

    /// Single letters and all-capital acronyms such as `TMA` are never flagged.
    pub fn check(&self, text: &str) -> Vec<Misspelling> {
        word_pattern()
            .find_iter(text)
            .filter(|m| is_checkable(m.as_str()))
            .filter(|m| !self.contains(m.as_str()))
            .map(|m| Misspelling {
                word: m.as_str().to_string(),
                offset: m.start(),
                suggestions: self.suggest(m.as_str()),
            })
            .collect()
    }
}

fn is_checkable(word: &str) -> bool {
    let letters = word.chars().filter(|c| c.is_alphabetic()).count();
    letters > 1 && !word.chars().all(|c| !c.is_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary() -> Dictionary {
        Dictionary::from_words([
            "the", "student", "argument", "is", "clear", "and", "well", "structured", "care",
            "cleat", "clean", "clears",
        ])
    }

    #[test]
    fn test_check_reports_offsets_and_suggestions() {
        let text = "The studnet's argment is clera.";
        let errors = dictionary().check(text);

        let words: Vec<&str> = errors.iter().map(|e| e.word.as_str()).collect();
        assert_eq!(words, vec!["studnet's", "argment", "clera"]);
        assert_eq!(&text[errors[1].offset..errors[1].offset + 7], "argment");
        assert_eq!(errors[1].suggestions, vec!["argument"]);
        assert_eq!(errors[2].suggestions, vec!["clean", "clear", "clears", "cleat"]);
    }

    #[test]
    fn test_possessive_and_case_accepted() {
        let d = dictionary();
        assert!(d.check("Student's ARGUMENT is Clear").is_empty());
        assert!(d.check("TMA a").is_empty());
    }

    #[test]
    fn test_suggestions_capped_and_ordered() {
        let d = dictionary();
        let suggestions = d.suggest("clea");
        assert!(suggestions.len() <= MAX_SUGGESTIONS);
        assert_eq!(suggestions, vec!["clean", "clear", "cleat", "clears"]);
        assert!(suggestions.iter().all(|s| strsim::levenshtein("clea", s) <= MAX_EDIT_DISTANCE));
    }

    #[test]
    fn test_load_skips_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "# custom words\nmarking\n\nFeedback\n").unwrap();

        let d = Dictionary::load(&path).unwrap();
        assert_eq!(d.len(), 2);
        assert!(d.contains("feedback"));
    }

    #[test]
    fn test_load_latin1_word_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, b"caf\xe9\nna\xefve\nresume\n").unwrap();

        let d = Dictionary::load(&path).unwrap();
        assert_eq!(d.len(), 3);
        assert!(d.contains("café"));
        assert!(d.check("naïve café").is_empty());
    }
}
