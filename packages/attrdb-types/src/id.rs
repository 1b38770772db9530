use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque printable identifier. Used both as entity identity and as
/// attribute-name identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(s: impl Into<String>) -> Self {
        Id(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the part after the rightmost `.` or `/`, or the whole id.
    pub fn last_segment(&self) -> &str {
        match self.0.rfind(['.', '/']) {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id(s)
    }
}

impl From<&Id> for Id {
    fn from(id: &Id) -> Self {
        id.clone()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns true if `s` is a valid keyword: first rune a letter, remaining
/// runes letters/digits or one of `_ - / . :`, not ending in a special.
pub fn is_keyword(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_alphabetic() {
        return false;
    }
    let mut last = first;
    for c in chars {
        if !c.is_alphanumeric() && !matches!(c, '_' | '-' | '/' | '.' | ':') {
            return false;
        }
        last = c;
    }
    last.is_alphanumeric()
}

/// An `Id` constrained to the keyword shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keyword(String);

impl Keyword {
    /// Constructs a keyword from a known-good string.
    ///
    /// # Panics
    ///
    /// Panics if `s` does not pass the keyword predicate. Use [`Keyword::parse`]
    /// at decoder boundaries.
    pub fn new(s: impl Into<String>) -> Self {
        let s = s.into();
        assert!(is_keyword(&s), "invalid keyword: {s:?}");
        Keyword(s)
    }

    /// Fallible constructor for untrusted input.
    pub fn parse(s: &str) -> Result<Self> {
        if is_keyword(s) {
            Ok(Keyword(s.to_string()))
        } else {
            Err(DataError::InvalidKeyword(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Keyword> for Id {
    fn from(k: Keyword) -> Self {
        Id(k.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_shapes() {
        assert!(is_keyword("a"));
        assert!(is_keyword("db/id"));
        assert!(is_keyword("db/entity.created-at"));
        assert!(is_keyword("entity/kind"));
        assert!(is_keyword("x_1:y"));

        assert!(!is_keyword(""));
        assert!(!is_keyword("1abc"));
        assert!(!is_keyword("_abc"));
        assert!(!is_keyword("abc/"));
        assert!(!is_keyword("abc."));
        assert!(!is_keyword("a b"));
    }

    #[test]
    fn keyword_parse_rejects() {
        assert!(Keyword::parse("db/id").is_ok());
        assert!(matches!(
            Keyword::parse("9lives"),
            Err(DataError::InvalidKeyword(_))
        ));
    }

    #[test]
    #[should_panic]
    fn keyword_new_panics() {
        let _ = Keyword::new("/nope");
    }

    #[test]
    fn last_segment() {
        assert_eq!(Id::new("miren/kind.sandbox").last_segment(), "sandbox");
        assert_eq!(Id::new("plain").last_segment(), "plain");
        assert_eq!(Id::new("a/b/c").last_segment(), "c");
    }
}
