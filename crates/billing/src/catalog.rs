//! Product catalog: the Stripe price ids that belong to Wildpatch, and the
//! communication locales we can send email in.
//!
//! The Stripe account may be shared with other products, so every webhook
//! handler filters events through [`PriceCatalog::contains`] before acting.

use std::collections::BTreeMap;

use crate::error::{BillingError, BillingResult};

/// Languages we have email templates for.
pub const SUPPORTED_LOCALES: &[&str] = &["en", "nl", "fr", "de", "es"];
pub const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone)]
pub struct PriceCatalog {
    /// tier name ("reduced", "normal", "solidarity") -> Stripe price id
    prices: BTreeMap<String, String>,
}

impl PriceCatalog {
    pub fn new(prices: BTreeMap<String, String>) -> Self {
        Self { prices }
    }

    /// Read `STRIPE_PRICE_IDS` from the environment, formatted as
    /// `name=price_...,name=price_...`.
    pub fn from_env() -> BillingResult<Self> {
        let raw = std::env::var("STRIPE_PRICE_IDS")
            .map_err(|_| BillingError::Validation("STRIPE_PRICE_IDS is not set".into()))?;
        let mut prices = BTreeMap::new();
        for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
            let (name, id) = pair.trim().split_once('=').ok_or_else(|| {
                BillingError::Validation(format!("malformed STRIPE_PRICE_IDS entry: {pair}"))
            })?;
            prices.insert(name.trim().to_string(), id.trim().to_string());
        }
        if prices.is_empty() {
            return Err(BillingError::Validation("STRIPE_PRICE_IDS is empty".into()));
        }
        Ok(Self { prices })
    }

    /// Whether a price id belongs to this product line.
    pub fn contains(&self, price_id: &str) -> bool {
        self.prices.values().any(|id| id == price_id)
    }

    pub fn contains_opt(&self, price_id: Option<&str>) -> bool {
        price_id.is_some_and(|id| self.contains(id))
    }

    pub fn price_ids(&self) -> impl Iterator<Item = &str> {
        self.prices.values().map(String::as_str)
    }
}

/// Resolve a requested locale to one we can send email in. Unrecognized
/// locales fall back to the default rather than failing the request.
pub fn resolve_locale(requested: Option<&str>) -> &'static str {
    let Some(requested) = requested else {
        return DEFAULT_LOCALE;
    };
    let primary = requested
        .split(['-', '_'])
        .next()
        .unwrap_or(requested)
        .to_ascii_lowercase();
    SUPPORTED_LOCALES
        .iter()
        .find(|l| **l == primary)
        .copied()
        .unwrap_or(DEFAULT_LOCALE)
}
