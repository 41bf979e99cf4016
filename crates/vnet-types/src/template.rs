//! Open attribute record used for range definitions and lease records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A flat key/value attribute record.
///
/// Keys are case-insensitive and stored upper-cased, so `size` and `SIZE`
/// name the same attribute. Values are kept as text; typed access goes
/// through [`Template::parse`].
///
/// ```
/// use vnet_types::Template;
///
/// let mut t = Template::new();
/// t.set("size", 16);
/// assert_eq!(t.get("SIZE"), Some("16"));
/// assert_eq!(t.parse::<u64>("Size"), Some(Ok(16)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Template {
    #[serde(flatten)]
    attrs: BTreeMap<String, String>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attrs.contains_key(&key.to_ascii_uppercase())
    }

    /// Returns the raw value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    /// Returns the value of `key` with surrounding whitespace removed,
    /// treating an empty value as absent.
    pub fn get_trimmed(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Parses the value of `key`.
    ///
    /// Returns `None` when the attribute is absent or blank, so callers can
    /// tell a missing field from a malformed one.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.get_trimmed(key).map(str::parse)
    }

    /// Sets `key`, returning the previous value.
    pub fn set(&mut self, key: &str, value: impl ToString) -> Option<String> {
        self.attrs.insert(key.to_ascii_uppercase(), value.to_string())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.attrs.remove(&key.to_ascii_uppercase())
    }

    /// Copies every attribute of `other` into `self`, replacing existing
    /// values.
    pub fn merge(&mut self, other: &Template) {
        for (k, v) in &other.attrs {
            self.attrs.insert(k.clone(), v.clone());
        }
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Template {
    fn from(map: BTreeMap<String, String>) -> Self {
        let attrs = map
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        Template { attrs }
    }
}

impl<K: AsRef<str>, V: ToString> FromIterator<(K, V)> for Template {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut t = Template::new();
        for (k, v) in iter {
            t.set(k.as_ref(), v);
        }
        t
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.attrs {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{k}=\"{v}\"")?;
            first = false;
        }
        Ok(())
    }
}
