// API token model. The clear-text secret only exists in `IssuedToken`, which is
// returned once by the create call; the store keeps a hash and a masked rendering.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker inserted by [`mask_secret`]. Its presence means a value is already masked.
const MASK_MARKER: &str = "_****";

/// Fallback prefix for secrets without an `<env>_` prefix.
const DEFAULT_PREFIX: &str = "tok";

/// Stored API token. Never carries the clear-text secret.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub masked_secret: String,
    pub environment: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub allowed_ips: Vec<String>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub rate_limit_per_day: i32,
    pub vendor_name: Option<String>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
    pub is_super: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// `active ∧ ¬revoked ∧ (no expiry ∨ expiry > now)`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_revoked() && !self.is_expired(now)
    }

    pub fn ceilings(&self) -> RateCeilings {
        RateCeilings {
            per_minute: clamp_ceiling(self.rate_limit_per_minute),
            per_hour: clamp_ceiling(self.rate_limit_per_hour),
            per_day: clamp_ceiling(self.rate_limit_per_day),
        }
    }
}

fn clamp_ceiling(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

/// Per-window request ceilings. `0` disables that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCeilings {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

/// Descriptive deployment tag. Not enforced anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "staging" | "stg" => Some(Self::Staging),
            "development" | "dev" => Some(Self::Development),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Test => "test",
        }
    }

    /// Short code used as the secret prefix, e.g. `prod_3fa9…`.
    pub fn secret_prefix(&self) -> &'static str {
        match self {
            Self::Production => "prod",
            Self::Staging => "stg",
            Self::Development => "dev",
            Self::Test => "test",
        }
    }
}

/// Insert payload for a new token. Produced by [`NewToken::issue`].
#[derive(Debug, Clone)]
pub struct NewToken {
    pub name: String,
    pub secret_hash: String,
    pub masked_secret: String,
    pub environment: Environment,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_ips: Vec<String>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub rate_limit_per_day: i32,
    pub vendor_name: Option<String>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
    pub is_super: bool,
    pub created_by: Option<i64>,
}

/// Attributes an administrator chooses for a new token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenSpec {
    pub name: String,
    pub environment: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub rate_limit_per_minute: i32,
    #[serde(default)]
    pub rate_limit_per_hour: i32,
    #[serde(default)]
    pub rate_limit_per_day: i32,
    pub vendor_name: Option<String>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
    #[serde(default)]
    pub is_super: bool,
}

/// A freshly minted token: the only place the clear secret is ever held.
#[derive(Debug)]
pub struct IssuedToken {
    pub secret: String,
    pub record: NewToken,
}

impl NewToken {
    /// Mint a random secret for `spec` and derive its stored hash and mask.
    pub fn issue(spec: TokenSpec, environment: Environment, created_by: Option<i64>) -> IssuedToken {
        let secret = generate_secret(environment);
        let record = NewToken {
            name: spec.name,
            secret_hash: hash_secret(&secret),
            masked_secret: mask_secret(&secret),
            environment,
            expires_at: spec.expires_at,
            allowed_ips: spec.allowed_ips,
            rate_limit_per_minute: spec.rate_limit_per_minute,
            rate_limit_per_hour: spec.rate_limit_per_hour,
            rate_limit_per_day: spec.rate_limit_per_day,
            vendor_name: spec.vendor_name,
            filter_column: spec.filter_column,
            filter_value: spec.filter_value,
            is_super: spec.is_super,
            created_by,
        };
        IssuedToken { secret, record }
    }
}

/// Partial update. `None` leaves a field untouched; the nested `Option`s let a
/// caller clear nullable columns explicitly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenUpdate {
    pub name: Option<String>,
    pub environment: Option<String>,
    #[serde(default, with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub allowed_ips: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_hour: Option<i32>,
    pub rate_limit_per_day: Option<i32>,
    #[serde(default, with = "double_option")]
    pub vendor_name: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub filter_column: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub filter_value: Option<Option<String>>,
    pub is_super: Option<bool>,
}

impl TokenUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.environment.is_none()
            && self.expires_at.is_none()
            && self.allowed_ips.is_none()
            && self.rate_limit_per_minute.is_none()
            && self.rate_limit_per_hour.is_none()
            && self.rate_limit_per_day.is_none()
            && self.vendor_name.is_none()
            && self.filter_column.is_none()
            && self.filter_value.is_none()
            && self.is_super.is_none()
    }

    /// Project the update onto `token` without persisting it.
    pub fn apply_to(&self, token: &mut Token) {
        if let Some(name) = &self.name {
            token.name = name.clone();
        }
        if let Some(env) = &self.environment {
            token.environment = env.clone();
        }
        if let Some(exp) = self.expires_at {
            token.expires_at = exp;
        }
        if let Some(ips) = &self.allowed_ips {
            token.allowed_ips = ips.clone();
        }
        if let Some(v) = self.rate_limit_per_minute {
            token.rate_limit_per_minute = v;
        }
        if let Some(v) = self.rate_limit_per_hour {
            token.rate_limit_per_hour = v;
        }
        if let Some(v) = self.rate_limit_per_day {
            token.rate_limit_per_day = v;
        }
        if let Some(v) = &self.vendor_name {
            token.vendor_name = v.clone();
        }
        if let Some(v) = &self.filter_column {
            token.filter_column = v.clone();
        }
        if let Some(v) = &self.filter_value {
            token.filter_value = v.clone();
        }
        if let Some(v) = self.is_super {
            token.is_super = v;
        }
    }
}

/// Distinguishes "field absent" from "field explicitly null" in PATCH bodies.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Token as rendered by list/detail endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TokenView {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub environment: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub allowed_ips: Vec<String>,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub rate_limit_per_day: i32,
    pub vendor_name: Option<String>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
    pub is_super: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Token> for TokenView {
    fn from(t: &Token) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            // stored value is already masked; mask_secret is a no-op on it
            token: mask_secret(&t.masked_secret),
            environment: t.environment.clone(),
            is_active: t.is_active,
            expires_at: t.expires_at,
            revoked_at: t.revoked_at,
            revoked_reason: t.revoked_reason.clone(),
            allowed_ips: t.allowed_ips.clone(),
            rate_limit_per_minute: t.rate_limit_per_minute,
            rate_limit_per_hour: t.rate_limit_per_hour,
            rate_limit_per_day: t.rate_limit_per_day,
            vendor_name: t.vendor_name.clone(),
            filter_column: t.filter_column.clone(),
            filter_value: t.filter_value.clone(),
            is_super: t.is_super,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

/// `<env>_<64 hex chars>` from the OS RNG.
pub fn generate_secret(environment: Environment) -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("{}_{}", environment.secret_prefix(), hex::encode(bytes))
}

/// SHA-256 hex digest used as the lookup key for secrets and session tokens.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Render a secret for display: `prefix_****last4`, or `prefix_****` when the
/// part after the prefix has four characters or fewer. Already-masked input is
/// returned unchanged.
pub fn mask_secret(secret: &str) -> String {
    if is_masked(secret) {
        return secret.to_string();
    }
    let (prefix, rest) = match secret.split_once('_') {
        Some((p, r)) if !p.is_empty() => (p, r),
        _ => (DEFAULT_PREFIX, secret),
    };
    let chars: Vec<char> = rest.chars().collect();
    if chars.len() <= 4 {
        return format!("{prefix}{MASK_MARKER}");
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}{MASK_MARKER}{tail}")
}

pub fn is_masked(value: &str) -> bool {
    value.contains(MASK_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_token() -> Token {
        let now = Utc::now();
        Token {
            id: 1,
            name: "sample".into(),
            secret_hash: hash_secret("prod_abcdef123456"),
            masked_secret: mask_secret("prod_abcdef123456"),
            environment: "production".into(),
            is_active: true,
            expires_at: None,
            revoked_at: None,
            revoked_reason: None,
            allowed_ips: vec![],
            rate_limit_per_minute: 0,
            rate_limit_per_hour: 0,
            rate_limit_per_day: 0,
            vendor_name: None,
            filter_column: None,
            filter_value: None,
            is_super: false,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_mask_secret_shows_prefix_and_last_four() {
        assert_eq!(mask_secret("prod_abcdef123456"), "prod_****3456");
    }

    #[test]
    fn test_mask_secret_short_secret_hides_tail() {
        assert_eq!(mask_secret("dev_abcd"), "dev_****");
        assert_eq!(mask_secret("dev_ab"), "dev_****");
    }

    #[test]
    fn test_mask_secret_without_prefix_uses_default() {
        assert_eq!(mask_secret("abcdefgh"), "tok_****efgh");
    }

    #[test]
    fn test_mask_secret_is_idempotent() {
        let once = mask_secret("stg_0123456789abcdef");
        let twice = mask_secret(&once);
        assert_eq!(once, twice);
        assert_eq!(mask_secret(&mask_secret("dev_ab")), "dev_****");
    }

    #[test]
    fn test_generated_secret_has_env_prefix_and_is_unique() {
        let a = generate_secret(Environment::Staging);
        let b = generate_secret(Environment::Staging);
        assert!(a.starts_with("stg_"));
        assert_eq!(a.len(), 4 + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_issue_never_stores_clear_secret() {
        let issued = NewToken::issue(
            TokenSpec {
                name: "vendor".into(),
                ..Default::default()
            },
            Environment::Production,
            Some(7),
        );
        assert_eq!(issued.record.secret_hash, hash_secret(&issued.secret));
        assert!(is_masked(&issued.record.masked_secret));
        assert!(!issued.record.masked_secret.contains(&issued.secret[5..]));
    }

    #[test]
    fn test_validity_rules() {
        let now = Utc::now();
        let mut t = sample_token();
        assert!(t.is_valid(now));

        t.expires_at = Some(now);
        assert!(!t.is_valid(now), "expiry equal to now is expired");

        t.expires_at = Some(now + Duration::hours(1));
        assert!(t.is_valid(now));

        t.revoked_at = Some(now);
        assert!(!t.is_valid(now));

        t.revoked_at = None;
        t.is_active = false;
        assert!(!t.is_valid(now));
    }

    #[test]
    fn test_negative_ceilings_are_unlimited() {
        let mut t = sample_token();
        t.rate_limit_per_minute = -5;
        t.rate_limit_per_hour = 10;
        let c = t.ceilings();
        assert_eq!(c.per_minute, 0);
        assert_eq!(c.per_hour, 10);
    }

    #[test]
    fn test_token_update_distinguishes_null_from_absent() {
        let update: TokenUpdate =
            serde_json::from_str(r#"{"filter_column": null, "name": "renamed"}"#).unwrap();
        assert_eq!(update.filter_column, Some(None));
        assert!(update.filter_value.is_none());

        let mut t = sample_token();
        t.filter_column = Some("flm_name".into());
        update.apply_to(&mut t);
        assert_eq!(t.name, "renamed");
        assert!(t.filter_column.is_none());
    }

    #[test]
    fn test_empty_update_detected() {
        let update: TokenUpdate = serde_json::from_str("{}").unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn test_view_never_exposes_hash() {
        let t = sample_token();
        let json = serde_json::to_value(TokenView::from(&t)).unwrap();
        assert_eq!(json["token"], "prod_****3456");
        assert!(json.get("secret_hash").is_none());
    }
}
