//! Label matchers.

use super::labels::Labels;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        };
        f.write_str(op)
    }
}

/// A predicate over a single label value.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub kind: MatchType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    /// Build a matcher. Regular expressions are fully anchored.
    pub fn new(
        kind: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let value = value.into();
        let re = match kind {
            MatchType::Regex | MatchType::NotRegex => {
                Some(Regex::new(&format!("^(?s:{})$", value))?)
            }
            _ => None,
        };
        Ok(Self {
            kind,
            name: name.into(),
            value,
            re,
        })
    }

    /// Equality matcher; never fails.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MatchType::Equal,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    pub fn matches(&self, v: &str) -> bool {
        match self.kind {
            MatchType::Equal => v == self.value,
            MatchType::NotEqual => v != self.value,
            MatchType::Regex => self.re.as_ref().is_some_and(|re| re.is_match(v)),
            MatchType::NotRegex => !self.re.as_ref().is_some_and(|re| re.is_match(v)),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind, self.value)
    }
}

/// True when every matcher accepts the corresponding label value.
pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels.get(&m.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_is_anchored() {
        let m = Matcher::new(MatchType::Regex, "job", "api").unwrap();
        assert!(m.matches("api"));
        assert!(!m.matches("api-server"));

        let m = Matcher::new(MatchType::Regex, "job", "api.*").unwrap();
        assert!(m.matches("api-server"));
    }

    #[test]
    fn test_negative_matchers() {
        let m = Matcher::new(MatchType::NotEqual, "job", "x").unwrap();
        assert!(m.matches(""));
        assert!(!m.matches("x"));

        let m = Matcher::new(MatchType::NotRegex, "job", "x|y").unwrap();
        assert!(m.matches("z"));
        assert!(!m.matches("y"));
    }

    #[test]
    fn test_matches_all() {
        let labels: Labels = [("__name__", "up"), ("job", "x")].into_iter().collect();
        let ms = vec![Matcher::equal("__name__", "up"), Matcher::equal("job", "x")];
        assert!(matches_all(&ms, &labels));

        let ms = vec![Matcher::equal("instance", "")];
        assert!(matches_all(&ms, &labels));
    }
}
