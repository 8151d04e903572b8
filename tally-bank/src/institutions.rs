use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BankError, Result};

/// Internal institution key (e.g. `"nordea"`) to aggregator institution id.
///
/// Loaded from configuration so new banks need no code change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct InstitutionMap {
    entries: BTreeMap<String, String>,
}

impl InstitutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, institution_id: impl Into<String>) {
        self.entries.insert(key.into().to_lowercase(), institution_id.into());
    }

    /// Keys are case-insensitive. A value that is already an aggregator id
    /// (present on the right-hand side) resolves to itself.
    pub fn resolve(&self, key: &str) -> Result<&str> {
        if let Some(id) = self.entries.get(&key.to_lowercase()) {
            return Ok(id);
        }
        self.entries
            .values()
            .find(|id| id.as_str() == key)
            .map(String::as_str)
            .ok_or_else(|| BankError::UnknownInstitution(key.to_string()))
    }

    /// Reverse lookup, for display
    pub fn key_for(&self, institution_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, id)| id.as_str() == institution_id)
            .map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, String>> for InstitutionMap {
    fn from(entries: BTreeMap<String, String>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<InstitutionMap> for BTreeMap<String, String> {
    fn from(map: InstitutionMap) -> Self {
        map.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InstitutionMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
