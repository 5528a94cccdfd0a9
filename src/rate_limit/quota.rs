//! Static per-tier / per-category quota table
//!
//! Built once at startup and read-only afterwards, so lookups need no locking.

use super::types::{Category, Quota, Tier};
use crate::error::{AdmissionError, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Category name → quota, as it appears in configuration
pub type QuotaSet = BTreeMap<String, Quota>;

/// Immutable lookup table from (tier, category) to quota
#[derive(Debug, Clone)]
pub struct QuotaTable {
    guest: HashMap<Category, Quota>,
    tiers: HashMap<Tier, HashMap<Category, Quota>>,
    min_max_attempts: u32,
}

impl QuotaTable {
    /// Build the table, rejecting sets without a `default` entry or with zero limits
    pub fn new(guest: &QuotaSet, free: &QuotaSet, premium: &QuotaSet) -> Result<Self> {
        let guest = Self::build_set("guest", guest)?;
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Free, Self::build_set("free", free)?);
        tiers.insert(Tier::Premium, Self::build_set("premium", premium)?);

        let min_max_attempts = guest
            .values()
            .chain(tiers.values().flat_map(|set| set.values()))
            .map(|quota| quota.max_attempts)
            .min()
            .unwrap_or(1);

        Ok(Self {
            guest,
            tiers,
            min_max_attempts,
        })
    }

    fn build_set(name: &str, set: &QuotaSet) -> Result<HashMap<Category, Quota>> {
        let mut built = HashMap::with_capacity(set.len());
        for (category, quota) in set {
            if quota.max_attempts == 0 {
                return Err(AdmissionError::Config(format!(
                    "Quota max_attempts must be > 0 for {}.{}",
                    name, category
                )));
            }
            if quota.window_secs == 0 {
                return Err(AdmissionError::Config(format!(
                    "Quota window must be > 0 for {}.{}",
                    name, category
                )));
            }
            let normalised = Category::parse(category).map_err(|e| {
                AdmissionError::Config(format!("Invalid category in {}: {}", name, e))
            })?;
            if built.insert(normalised.clone(), *quota).is_some() {
                return Err(AdmissionError::Config(format!(
                    "Quota set '{}' defines category '{}' more than once",
                    name, normalised
                )));
            }
        }

        if !built.contains_key(&Category::default_category()) {
            return Err(AdmissionError::Config(format!(
                "Quota set '{}' must define a 'default' category",
                name
            )));
        }

        Ok(built)
    }

    /// Quota for an authenticated tier, falling back to the tier's `default`
    pub fn lookup(&self, tier: Tier, category: &Category) -> Quota {
        // Both tiers are always present after construction
        let set = &self.tiers[&tier];
        Self::lookup_in(set, category)
    }

    /// Tier whose quotas apply to a raw tier name; unrecognised tiers get free
    pub fn resolve_tier(&self, name: &str) -> Tier {
        Tier::parse(name).unwrap_or_else(|| {
            debug!(tier = name, "Unknown tier, using free-tier quotas");
            Tier::Free
        })
    }

    /// Quota for anonymous subjects; never indexed by tier
    pub fn guest(&self, category: &Category) -> Quota {
        Self::lookup_in(&self.guest, category)
    }

    /// Quota of the next tier up, if there is one
    pub fn upgrade_for(&self, tier: Tier, category: &Category) -> Option<Quota> {
        match tier {
            Tier::Free => Some(self.lookup(Tier::Premium, category)),
            Tier::Premium => None,
        }
    }

    /// Smallest `max_attempts` across every configured entry
    pub fn min_max_attempts(&self) -> u32 {
        self.min_max_attempts
    }

    fn lookup_in(set: &HashMap<Category, Quota>, category: &Category) -> Quota {
        match set.get(category) {
            Some(quota) => *quota,
            None => {
                debug!(category = %category, "Unknown category, using default quota");
                set[&Category::default_category()]
            }
        }
    }
}

impl Default for QuotaTable {
    fn default() -> Self {
        Self::new(&default_guest(), &default_free(), &default_premium())
            .unwrap_or_else(|e| unreachable!("built-in quota table is valid: {}", e))
    }
}

fn quota_set(entries: &[(&str, u32, u64)]) -> QuotaSet {
    entries
        .iter()
        .map(|(category, max, window)| (category.to_string(), Quota::new(*max, *window)))
        .collect()
}

pub fn default_guest() -> QuotaSet {
    quota_set(&[
        (Category::DEFAULT, 30, 60),
        (Category::API, 20, 60),
        (Category::MEDIA, 10, 60),
        (Category::SOCIAL, 15, 60),
    ])
}

pub fn default_free() -> QuotaSet {
    quota_set(&[
        (Category::DEFAULT, 60, 60),
        (Category::API, 120, 60),
        (Category::MEDIA, 30, 60),
        (Category::SOCIAL, 60, 60),
    ])
}

pub fn default_premium() -> QuotaSet {
    quota_set(&[
        (Category::DEFAULT, 300, 60),
        (Category::API, 600, 60),
        (Category::MEDIA, 150, 60),
        (Category::SOCIAL, 300, 60),
    ])
}
