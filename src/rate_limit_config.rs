use crate::config::positive;
use crate::validation::validate_limits;
use serde_json::Value;

/// Attempts allowed per window and the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_attempts: u64,
    pub decay_seconds: u64,
}

impl Limits {
    pub fn new(max_attempts: u64, decay_seconds: u64) -> Self {
        Self {
            max_attempts,
            decay_seconds,
        }
    }

    /// Parse an inline `"max,decay"` pair such as `"5, 60"`. Both values
    /// must be positive.
    pub fn parse_inline(value: &str) -> Option<Self> {
        let (max_attempts, decay_seconds) = inline_pair(value)?;
        validate_limits(max_attempts, decay_seconds).ok()?;
        Some(Self::new(max_attempts, decay_seconds))
    }

    /// Limits of a preset entry; `max_attempts`/`max` and
    /// `decay_seconds`/`decay`, both positive.
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry = value.as_object()?;
        let max_attempts = entry.get("max_attempts").or_else(|| entry.get("max"))?;
        let decay_seconds = entry.get("decay_seconds").or_else(|| entry.get("decay"))?;
        Some(Self::new(positive(max_attempts)?, positive(decay_seconds)?))
    }
}

/// The two numbers of a `"max,decay"` role, zeros included.
pub fn inline_pair(value: &str) -> Option<(u64, u64)> {
    let (max_attempts, decay_seconds) = value.split_once(',')?;
    Some((parse_count(max_attempts)?, parse_count(decay_seconds)?))
}

fn parse_count(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Field read from the request when the account field is not configured.
pub const DEFAULT_ACCOUNT_FIELD: &str = "email";

/// The account half of a two-tier preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTier {
    /// Request input holding the account identifier.
    pub field: String,
    /// `None` when the configured limits are unusable; the tier is skipped.
    pub limits: Option<Limits>,
}

/// A named limit policy from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preset {
    Single(Option<Limits>),
    /// Per-IP limits plus per-account limits.
    TwoTier {
        ip: Option<Limits>,
        account: AccountTier,
    },
}

impl Preset {
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry = value.as_object()?;

        let Some(account) = entry.get("account").filter(|account| account.is_object()) else {
            return Some(Preset::Single(Limits::from_value(value)));
        };

        // Without an `ip` section the IP limits sit next to `account`.
        let ip = match entry.get("ip") {
            Some(ip) if ip.is_object() => Limits::from_value(ip),
            _ => Limits::from_value(value),
        };
        let field = account
            .get("field")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .unwrap_or(DEFAULT_ACCOUNT_FIELD)
            .to_string();

        Some(Preset::TwoTier {
            ip,
            account: AccountTier {
                field,
                limits: Limits::from_value(account),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inline_limits() {
        assert_eq!(Limits::parse_inline("5,60"), Some(Limits::new(5, 60)));
        assert_eq!(Limits::parse_inline(" 10 , 120 "), Some(Limits::new(10, 120)));
        assert_eq!(Limits::parse_inline("login"), None);
        assert_eq!(Limits::parse_inline("5,"), None);
        assert_eq!(Limits::parse_inline("-5,60"), None);
        assert_eq!(Limits::parse_inline("5,60,1"), None);
        assert_eq!(Limits::parse_inline("+5,60"), None);
        assert_eq!(Limits::parse_inline("0,60"), None);
        assert_eq!(Limits::parse_inline("5,0"), None);
    }

    #[test]
    fn test_inline_pair_keeps_zeros() {
        assert_eq!(inline_pair("0, 60"), Some((0, 60)));
        assert_eq!(inline_pair("5,0"), Some((5, 0)));
        assert_eq!(inline_pair("login"), None);
        assert_eq!(inline_pair("5,x"), None);
    }

    #[test]
    fn test_limits_from_value_accepts_short_names() {
        assert_eq!(
            Limits::from_value(&json!({ "max_attempts": 5, "decay_seconds": 60 })),
            Some(Limits::new(5, 60))
        );
        assert_eq!(
            Limits::from_value(&json!({ "max": "3", "decay": 30 })),
            Some(Limits::new(3, 30))
        );
        assert_eq!(Limits::from_value(&json!({ "max": 0, "decay": 30 })), None);
        assert_eq!(Limits::from_value(&json!({ "max": 3 })), None);
        assert_eq!(Limits::from_value(&json!("5,60")), None);
    }

    #[test]
    fn test_single_preset() {
        let preset = Preset::from_value(&json!({ "max_attempts": 5, "decay_seconds": 60 }));
        assert_eq!(preset, Some(Preset::Single(Some(Limits::new(5, 60)))));

        assert_eq!(Preset::from_value(&json!(42)), None);
    }

    #[test]
    fn test_two_tier_preset() {
        let preset = Preset::from_value(&json!({
            "ip": { "max_attempts": 10, "decay_seconds": 60 },
            "account": { "max_attempts": 1, "decay_seconds": 60, "field": "username" }
        }))
        .unwrap();

        assert_eq!(
            preset,
            Preset::TwoTier {
                ip: Some(Limits::new(10, 60)),
                account: AccountTier {
                    field: "username".to_string(),
                    limits: Some(Limits::new(1, 60)),
                },
            }
        );
    }

    #[test]
    fn test_two_tier_preset_defaults() {
        let preset = Preset::from_value(&json!({
            "max": 20, "decay": 60,
            "account": { "max": 0, "decay": 60 }
        }))
        .unwrap();

        assert_eq!(
            preset,
            Preset::TwoTier {
                ip: Some(Limits::new(20, 60)),
                account: AccountTier {
                    field: DEFAULT_ACCOUNT_FIELD.to_string(),
                    limits: None,
                },
            }
        );
    }
}
