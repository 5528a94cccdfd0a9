use crate::error::{AdmissionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Prefix shared by every per-subject counter in the counter store
pub const COUNTER_PREFIX: &str = "ratelimit:";

/// Subscription tier of an authenticated subject
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    /// Parse a tier name, returning `None` for anything unrecognised
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// Quota bucket a request is charged against
///
/// The well-known categories are provided as constants; configuration may add
/// more, so this is an open newtype rather than an enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub const DEFAULT: &'static str = "default";
    pub const API: &'static str = "api";
    pub const MEDIA: &'static str = "media";
    pub const SOCIAL: &'static str = "social";

    /// Normalise a category name
    ///
    /// `:` separates counter key segments, so it is replaced with `_`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_ascii_lowercase().replace(':', "_"))
    }

    /// Parse an externally supplied category name, rejecting `:` and empty names
    pub fn parse(name: &str) -> Result<Self> {
        if name.contains(':') {
            return Err(AdmissionError::InvalidRequest(format!(
                "Category '{}' must not contain ':'",
                name
            )));
        }
        let category = Self::new(name);
        if category.0.is_empty() {
            return Err(AdmissionError::InvalidRequest(
                "Category must not be empty".to_string(),
            ));
        }
        Ok(category)
    }

    pub fn default_category() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(name: &str) -> Self {
        Category::new(name)
    }
}

impl From<String> for Category {
    fn from(name: String) -> Self {
        Category::new(name)
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.0
    }
}

/// Identity as handed over by the calling layer, before classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawIdentity {
    /// No credentials; accounted by client address
    Anonymous { ip: String },
    /// Logged-in user; `tier` is the raw tier name from the user record
    Authenticated { user_id: String, tier: String },
}

/// Identity used for quota accounting, resolved once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Anonymous { ip: String },
    Authenticated { user_id: String, tier: Tier },
    /// Bypasses all accounting
    Internal,
}

impl Subject {
    /// Counter-store key fragment for this subject
    ///
    /// Anonymous and authenticated subjects live in separate scopes so an IP
    /// and a user id with the same text never share a counter.
    pub fn subject_key(&self) -> Option<String> {
        match self {
            Subject::Anonymous { ip } => Some(format!("guest:{}", ip)),
            Subject::Authenticated { user_id, .. } => Some(format!("user:{}", user_id)),
            Subject::Internal => None,
        }
    }

    pub fn class(&self) -> SubjectClass {
        match self {
            Subject::Anonymous { .. } => SubjectClass::Guest,
            Subject::Authenticated {
                tier: Tier::Free, ..
            } => SubjectClass::Free,
            Subject::Authenticated {
                tier: Tier::Premium,
                ..
            } => SubjectClass::Premium,
            Subject::Internal => SubjectClass::Internal,
        }
    }
}

/// Coarse subject class used for 429 bodies and metric labels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubjectClass {
    Guest,
    Free,
    Premium,
    Internal,
}

impl SubjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectClass::Guest => "guest",
            SubjectClass::Free => "free",
            SubjectClass::Premium => "premium",
            SubjectClass::Internal => "internal",
        }
    }
}

/// Limit for one (tier, category) pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    /// Maximum number of requests allowed in the window
    pub max_attempts: u32,
    /// Window length (in seconds)
    pub window_secs: u64,
}

impl Quota {
    pub const fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window_secs,
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The limit is exceeded strictly above `max_attempts`
    pub fn is_exceeded_by(&self, count: i64) -> bool {
        count > i64::from(self.max_attempts)
    }
}

/// Counter-store key for a subject in a category
pub fn counter_key(category: &Category, subject_key: &str) -> String {
    format!("{}{}:{}", COUNTER_PREFIX, category, subject_key)
}

/// Details of a denial, consumed by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Seconds until the window resets; always within `1..=quota.window_secs`
    pub retry_after_secs: u64,
    pub subject_class: SubjectClass,
    pub category: Category,
    /// The quota that was exceeded
    pub quota: Quota,
    /// Quota of the next tier up, for free-tier upsell messaging
    pub upgrade: Option<Quota>,
}

/// Outcome of an admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny(denial) => Some(denial.retry_after_secs),
        }
    }
}

/// Which way through the decider a request went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionPath {
    /// Internal or elevated caller; no accounting
    Bypassed,
    /// Local damper granted a skip of the remote check
    ShortCircuited,
    /// The shared counter was incremented and compared
    QuotaChecked,
    /// The shared counter could not be consulted
    Degraded,
}

impl DecisionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPath::Bypassed => "bypassed",
            DecisionPath::ShortCircuited => "short_circuited",
            DecisionPath::QuotaChecked => "quota_checked",
            DecisionPath::Degraded => "degraded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_format() {
        let subject = Subject::Authenticated {
            user_id: "42".to_string(),
            tier: Tier::Free,
        };
        let key = counter_key(&Category::new("media"), &subject.subject_key().unwrap());
        assert_eq!(key, "ratelimit:media:user:42");
    }

    #[test]
    fn test_category_cannot_forge_key_segments() {
        let guest = Subject::Anonymous {
            ip: "x".to_string(),
        };
        let user = Subject::Authenticated {
            user_id: "guest:x".to_string(),
            tier: Tier::Free,
        };

        let forged = counter_key(&Category::new("media:user"), &guest.subject_key().unwrap());
        let real = counter_key(&Category::new("media"), &user.subject_key().unwrap());
        assert_eq!(real, "ratelimit:media:user:guest:x");
        assert_eq!(forged, "ratelimit:media_user:guest:x");
        assert_ne!(forged, real);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(Category::parse(" Media ").unwrap(), Category::new("media"));
        assert!(matches!(
            Category::parse("media:user"),
            Err(AdmissionError::InvalidRequest(_))
        ));
        assert!(Category::parse("   ").is_err());

        let category: Category = serde_json::from_str("\"Api:v2\"").unwrap();
        assert_eq!(category.as_str(), "api_v2");
        assert_eq!(serde_json::to_string(&category).unwrap(), "\"api_v2\"");
    }

    #[test]
    fn test_guest_and_user_keys_never_collide() {
        let guest = Subject::Anonymous {
            ip: "1234".to_string(),
        };
        let user = Subject::Authenticated {
            user_id: "1234".to_string(),
            tier: Tier::Premium,
        };
        assert_ne!(guest.subject_key(), user.subject_key());
        assert_eq!(Subject::Internal.subject_key(), None);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(Tier::parse("Premium"), Some(Tier::Premium));
        assert_eq!(Tier::parse(" free "), Some(Tier::Free));
        assert_eq!(Tier::parse("gold"), None);
    }

    #[test]
    fn test_category_is_normalised() {
        assert_eq!(Category::new(" Media ").as_str(), "media");
        assert_eq!(Category::default_category().as_str(), Category::DEFAULT);
    }

    #[test]
    fn test_quota_limit_is_strict() {
        let quota = Quota::new(3, 60);
        assert!(!quota.is_exceeded_by(3));
        assert!(quota.is_exceeded_by(4));
        assert_eq!(quota.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_raw_identity_deserialize() {
        let raw: RawIdentity =
            serde_json::from_str(r#"{"kind":"authenticated","user_id":"u1","tier":"premium"}"#)
                .unwrap();
        assert_eq!(
            raw,
            RawIdentity::Authenticated {
                user_id: "u1".to_string(),
                tier: "premium".to_string()
            }
        );
    }
}
