use std::fmt;

use serde::{Deserialize, Serialize};

use tally_core::config::RulesConfig;

/// Entity identifier shape: a fixed prefix followed by exactly `digits` ASCII digits
/// (`U` + 5 digits gives `U00001`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdPattern {
    prefix: String,
    digits: usize,
}

impl EntityIdPattern {
    pub fn new(prefix: impl Into<String>, digits: usize) -> Self {
        Self {
            prefix: prefix.into(),
            digits,
        }
    }

    pub fn from_rules(rules: &RulesConfig) -> Self {
        Self::new(rules.entity_id_prefix.clone(), rules.entity_id_digits)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match candidate.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.len() == self.digits && rest.bytes().all(|b| b.is_ascii_digit()),
            None => false,
        }
    }
}

impl Default for EntityIdPattern {
    fn default() -> Self {
        Self::new("U", 5)
    }
}

impl fmt::Display for EntityIdPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{}\\d{{{}}}$", self.prefix, self.digits)
    }
}
