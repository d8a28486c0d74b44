//! Pricebook: read-mostly resource pricing for metering.
//!
//! Costs are integer minor units throughout; a price entry says what
//! `per_units` of the resource cost, and [`Pricebook::price`] scales by
//! quantity with ceiling division so fractional remainders never
//! undercharge.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Pricebook errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PricebookError {
    /// No price configured for the resource type.
    #[error("unknown resource type: {resource_type}")]
    UnknownResource {
        /// The unpriced resource type.
        resource_type: String,
    },

    /// Negative quantity.
    #[error("quantity must be non-negative, got {quantity}")]
    NegativeQuantity {
        /// The rejected quantity.
        quantity: i64,
    },

    /// A price entry failed validation at load time.
    #[error("invalid price entry for '{resource_type}': {detail}")]
    InvalidEntry {
        /// The offending resource type.
        resource_type: String,
        /// What was wrong.
        detail: String,
    },

    /// The source document failed to parse.
    #[error("pricebook parse error: {message}")]
    Parse {
        /// Description of the failure.
        message: String,
    },
}

/// One priced resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    /// Cost of `per_units` units, in minor units.
    pub unit_cost_minor: i64,

    /// Batch size the cost applies to (e.g. 1000 for per-1k-token
    /// pricing). Defaults to 1.
    #[serde(default = "default_per_units")]
    pub per_units: i64,

    /// ASCII-3 currency code.
    pub currency: String,
}

const fn default_per_units() -> i64 {
    1
}

/// A computed price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Price {
    /// Total cost in minor units.
    pub cost_minor_units: i64,

    /// Currency of the cost.
    pub currency: String,
}

/// Read-mostly `(resource_type -> price)` map with atomic whole-map
/// reloads; readers always see either the old or the new table, never a
/// partial update.
pub struct Pricebook {
    table: RwLock<Arc<HashMap<String, PriceEntry>>>,
}

impl Pricebook {
    /// Creates an empty pricebook (every lookup fails `UnknownResource`).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Creates a pricebook from entries, validating each.
    ///
    /// # Errors
    ///
    /// `InvalidEntry` on a non-positive batch size, negative cost, or bad
    /// currency code.
    pub fn new(entries: HashMap<String, PriceEntry>) -> Result<Self, PricebookError> {
        validate_entries(&entries)?;
        Ok(Self {
            table: RwLock::new(Arc::new(entries)),
        })
    }

    /// Parses a pricebook from a TOML table of entries:
    ///
    /// ```toml
    /// ["openai:gpt-4:input-tokens"]
    /// unit_cost_minor = 3
    /// per_units = 1000
    /// currency = "USD"
    /// ```
    ///
    /// # Errors
    ///
    /// `Parse` on malformed TOML, `InvalidEntry` on bad entries.
    pub fn from_toml(text: &str) -> Result<Self, PricebookError> {
        let entries: HashMap<String, PriceEntry> =
            toml::from_str(text).map_err(|e| PricebookError::Parse {
                message: e.to_string(),
            })?;
        Self::new(entries)
    }

    /// Atomically replaces the whole table.
    ///
    /// # Errors
    ///
    /// `InvalidEntry` on bad entries; the current table stays in place.
    pub fn reload(&self, entries: HashMap<String, PriceEntry>) -> Result<(), PricebookError> {
        validate_entries(&entries)?;
        let count = entries.len();
        *self.table.write().unwrap() = Arc::new(entries);
        info!(entries = count, "pricebook reloaded");
        Ok(())
    }

    /// Computes the cost of `quantity` units of a resource type.
    ///
    /// Ceiling division: a remainder rounds the cost up one minor unit.
    ///
    /// # Errors
    ///
    /// `UnknownResource` for unpriced types, `NegativeQuantity` for
    /// negative input.
    pub fn price(&self, resource_type: &str, quantity: i64) -> Result<Price, PricebookError> {
        if quantity < 0 {
            return Err(PricebookError::NegativeQuantity { quantity });
        }
        let table = Arc::clone(&self.table.read().unwrap());
        let entry = table
            .get(resource_type)
            .ok_or_else(|| PricebookError::UnknownResource {
                resource_type: resource_type.to_string(),
            })?;

        let gross = i128::from(quantity) * i128::from(entry.unit_cost_minor);
        let per_units = i128::from(entry.per_units);
        let cost = (gross + per_units - 1) / per_units;
        Ok(Price {
            cost_minor_units: i64::try_from(cost).unwrap_or(i64::MAX),
            currency: entry.currency.clone(),
        })
    }

    /// Number of priced resource types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    /// True when no resource types are priced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_entries(entries: &HashMap<String, PriceEntry>) -> Result<(), PricebookError> {
    for (resource_type, entry) in entries {
        if entry.per_units <= 0 {
            return Err(PricebookError::InvalidEntry {
                resource_type: resource_type.clone(),
                detail: format!("per_units must be positive, got {}", entry.per_units),
            });
        }
        if entry.unit_cost_minor < 0 {
            return Err(PricebookError::InvalidEntry {
                resource_type: resource_type.clone(),
                detail: format!("unit_cost_minor must be non-negative, got {}", entry.unit_cost_minor),
            });
        }
        let currency_ok = entry.currency.len() == 3
            && entry.currency.bytes().all(|b| b.is_ascii_uppercase());
        if !currency_ok {
            return Err(PricebookError::InvalidEntry {
                resource_type: resource_type.clone(),
                detail: format!("bad currency code '{}'", entry.currency),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Pricebook {
        Pricebook::from_toml(
            r#"
            ["openai:gpt-4:input-tokens"]
            unit_cost_minor = 3
            per_units = 1000
            currency = "USD"

            ["tools:shell:exec"]
            unit_cost_minor = 50
            currency = "USD"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn prices_scale_by_quantity() {
        let book = book();
        let price = book.price("tools:shell:exec", 3).unwrap();
        assert_eq!(price.cost_minor_units, 150);
        assert_eq!(price.currency, "USD");
    }

    #[test]
    fn batch_pricing_rounds_up() {
        let book = book();
        // 1500 tokens at 3 minor units per 1000 = 4.5, rounds up to 5.
        assert_eq!(
            book.price("openai:gpt-4:input-tokens", 1500).unwrap().cost_minor_units,
            5
        );
        // Exactly one batch.
        assert_eq!(
            book.price("openai:gpt-4:input-tokens", 1000).unwrap().cost_minor_units,
            3
        );
        // Zero quantity costs nothing.
        assert_eq!(
            book.price("openai:gpt-4:input-tokens", 0).unwrap().cost_minor_units,
            0
        );
    }

    #[test]
    fn unknown_resource_errors() {
        assert!(matches!(
            book().price("api:unknown:thing", 1),
            Err(PricebookError::UnknownResource { .. })
        ));
    }

    #[test]
    fn negative_quantity_errors() {
        assert!(matches!(
            book().price("tools:shell:exec", -1),
            Err(PricebookError::NegativeQuantity { .. })
        ));
    }

    #[test]
    fn reload_swaps_atomically() {
        let book = book();
        let mut entries = HashMap::new();
        entries.insert(
            "tools:shell:exec".to_string(),
            PriceEntry {
                unit_cost_minor: 75,
                per_units: 1,
                currency: "USD".to_string(),
            },
        );
        book.reload(entries).unwrap();

        assert_eq!(book.len(), 1);
        assert_eq!(book.price("tools:shell:exec", 1).unwrap().cost_minor_units, 75);
        assert!(book.price("openai:gpt-4:input-tokens", 1).is_err());
    }

    #[test]
    fn bad_entries_rejected_and_table_kept() {
        let book = book();
        let mut entries = HashMap::new();
        entries.insert(
            "x".to_string(),
            PriceEntry {
                unit_cost_minor: 1,
                per_units: 0,
                currency: "USD".to_string(),
            },
        );
        assert!(matches!(
            book.reload(entries),
            Err(PricebookError::InvalidEntry { .. })
        ));
        // The previous table survived the failed reload.
        assert_eq!(book.len(), 2);
    }
}
