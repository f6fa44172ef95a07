//! Plate text normalization and grammar validation.
//!
//! Normalization is lossy: with confusable correction on, `O I S B Z Q` are
//! always read as `0 1 5 8 2 0`, so a genuine letter plate such as `29B-12345`
//! loses its letter and is rejected. The correction is a policy switch.

use std::sync::OnceLock;

use regex::Regex;

/// Regional plate grammars: 2-digit prefix, optional separator, 1–2 letters,
/// digit groups with optional separators before a 2-digit suffix.
const PLATE_GRAMMARS: [&str; 4] = [
    // 49-E1 222.22 / 49E122222
    r"^\d{2}-?[A-Z]\d[\s.]?\d{3}\.?\d{2}$",
    // 29Y5-59009 / 29YZ5-59009
    r"^\d{2}[A-Z]{1,2}\d-?\d{5}$",
    // 29A-12345 / 29A12345 / 29A-1234
    r"^\d{2}-?[A-Z]-?\d{4,5}$",
    // 29A-123.45
    r"^\d{2}-?[A-Z]-?\d{3}\.?\d{2}$",
];

fn grammars() -> &'static [Regex] {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PLATE_GRAMMARS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("plate grammar is valid"))
            .collect()
    })
}

fn confusable(c: char) -> char {
    match c {
        'O' | 'Q' => '0',
        'I' => '1',
        'S' => '5',
        'B' => '8',
        'Z' => '2',
        other => other,
    }
}

/// Counts of letters and digits, ignoring separators.
fn letter_digit_counts(text: &str) -> (usize, usize) {
    text.chars()
        .filter(|c| !matches!(c, '-' | '.' | ' '))
        .fold((0, 0), |(letters, digits), c| {
            if c.is_ascii_alphabetic() {
                (letters + 1, digits)
            } else if c.is_ascii_digit() {
                (letters, digits + 1)
            } else {
                (letters, digits)
            }
        })
}

/// Normalization and acceptance rules for OCR output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlateTextPolicy {
    /// Map `O I S B Z Q` to `0 1 5 8 2 0`.
    pub correct_confusables: bool,
    pub min_len: usize,
    pub max_len: usize,
    pub min_digits: usize,
    pub min_letters: usize,
}

impl Default for PlateTextPolicy {
    fn default() -> Self {
        Self {
            correct_confusables: true,
            min_len: 6,
            max_len: 15,
            min_digits: 5,
            min_letters: 1,
        }
    }
}

impl PlateTextPolicy {
    /// Uppercase, drop everything but `A-Z 0-9 - .` and whitespace, apply
    /// confusable correction, collapse whitespace.
    pub fn clean(&self, raw: &str) -> String {
        let filtered: String = raw
            .to_uppercase()
            .chars()
            .filter(|c| {
                c.is_ascii_uppercase()
                    || c.is_ascii_digit()
                    || matches!(c, '-' | '.')
                    || c.is_whitespace()
            })
            .map(|c| if self.correct_confusables { confusable(c) } else { c })
            .collect();
        filtered.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Cleaned text, if it passes the length and letter/digit gates.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let text = self.clean(raw);
        let len = text.chars().count();
        if len < self.min_len || len > self.max_len {
            return None;
        }
        let (letters, digits) = letter_digit_counts(&text);
        if letters < self.min_letters || digits < self.min_digits {
            return None;
        }
        Some(text)
    }

    /// Grammar match plus the letter/digit minimums.
    pub fn validate(&self, text: &str) -> bool {
        if text.chars().count() < self.min_len {
            return false;
        }
        if !grammars().iter().any(|grammar| grammar.is_match(text)) {
            return false;
        }
        let (letters, digits) = letter_digit_counts(text);
        digits >= self.min_digits && letters >= self.min_letters
    }

    /// Normalize then validate; `None` is a silent rejection.
    pub fn accept(&self, raw: &str) -> Option<String> {
        self.normalize(raw).filter(|text| self.validate(text))
    }
}
