//! Deterministic category resolution.
//!
//! Precedence: manual override > user rules (priority desc, oldest first) >
//! built-in keyword table > "Uncategorized". Resolution never fails.

use crate::categories;
use crate::model::{rule_order, CategorizationRule, CategorySource, Transaction, UNCATEGORIZED};

/// Result of resolving one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub category: String,
    pub source: CategorySource,
    /// Set when a user rule decided the category
    pub rule_id: Option<i64>,
}

impl Resolution {
    fn new(category: impl Into<String>, source: CategorySource, rule_id: Option<i64>) -> Self {
        Self {
            category: category.into(),
            source,
            rule_id,
        }
    }

    pub fn is_uncategorized(&self) -> bool {
        self.category == UNCATEGORIZED
    }
}

/// A user's rules, sorted once into evaluation order
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CategorizationRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<CategorizationRule>) -> Self {
        rules.sort_by(rule_order);
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose match test succeeds on `description`
    pub fn first_match(&self, description: &str) -> Option<&CategorizationRule> {
        self.rules.iter().find(|r| r.matches(description))
    }

    pub fn resolve(&self, txn: &Transaction) -> Resolution {
        if let Some(manual) = txn.user_category.as_deref() {
            return Resolution::new(manual, CategorySource::Manual, None);
        }

        if let Some(rule) = self.first_match(&txn.description) {
            return Resolution::new(rule.category.clone(), CategorySource::Rule, Some(rule.id));
        }

        // The built-in table also looks at counterparty names, which often
        // carry the merchant when the description is a card reference.
        let mut text = txn.description.clone();
        for name in [&txn.creditor_name, &txn.debtor_name].into_iter().flatten() {
            text.push(' ');
            text.push_str(name);
        }
        match categories::detect(&text) {
            Some(category) => Resolution::new(category.as_str(), CategorySource::Auto, None),
            None => Resolution::new(UNCATEGORIZED, CategorySource::Auto, None),
        }
    }
}

/// Resolve one transaction against an unsorted rule slice.
pub fn resolve(txn: &Transaction, rules: &[CategorizationRule]) -> Resolution {
    RuleSet::new(rules.to_vec()).resolve(txn)
}
