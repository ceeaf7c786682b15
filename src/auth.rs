//! Request authentication and token signing (§4.1).
//!
//! Canonical serialization flattens a request DTO into an ordered sequence of
//! `(key, scalar)` pairs — nested objects, arrays, and null are elided (§9).
//! The reserved `Token`/`token` key is always excluded; the team password is
//! folded in under `Password`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::clock::{ct_eq, Clock, Rng};
use crate::error::{GatewayError, GatewayResult};
use crate::store::TeamRegistry;
use crate::types::ExpiringToken;

/// A scalar request parameter. Complex values (objects, arrays, null) have no
/// representation here — callers drop them before building the map, which is
/// the projection step itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Decimal(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl ParamValue {
    fn canonical_string(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Decimal(d) => d.clone(),
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Timestamp(t) => t.to_rfc3339(),
        }
    }
}

/// Ordered, scalar-only projection of a request. Keys compare by Unicode
/// code point (`Ordinal`), which `BTreeMap<String, _>` already gives us.
pub type Params = BTreeMap<String, ParamValue>;

const RESERVED_TOKEN_KEY: &str = "token";
const PASSWORD_KEY: &str = "Password";

fn is_status_lookup(params: &Params) -> bool {
    params.contains_key("PaymentId") && params.contains_key("TeamSlug") && !params.contains_key("Amount")
}

/// Produce the deterministic SHA-256 signature for `params` under `password`
/// (§4.1). A bare status-check request signs bit-exact as `PaymentId ·
/// Password · TeamSlug` instead of lexicographic order.
pub fn sign(params: &Params, password: &str) -> String {
    let filtered: Params = params
        .iter()
        .filter(|(k, _)| k.to_ascii_lowercase() != RESERVED_TOKEN_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if is_status_lookup(&filtered) {
        let payment_id = filtered.get("PaymentId").map(ParamValue::canonical_string).unwrap_or_default();
        let team_slug = filtered.get("TeamSlug").map(ParamValue::canonical_string).unwrap_or_default();
        let concat = format!("{payment_id}{password}{team_slug}");
        return crate::crypto::sha256_hex(concat.as_bytes());
    }

    let mut with_password = filtered;
    with_password.insert(PASSWORD_KEY.to_string(), ParamValue::Str(password.to_string()));
    let concat: String = with_password
        .into_iter()
        .map(|(_, v)| v.canonical_string())
        .collect();
    crate::crypto::sha256_hex(concat.as_bytes())
}

/// Validate `token` against `params`/`password` using constant-time compare.
/// Mismatched length is rejected without leaking timing (§4.1).
pub fn validate(params: &Params, password: &str, token: &str) -> bool {
    let expected = sign(params, password);
    ct_eq(expected.as_bytes(), token.as_bytes())
}

const MAX_TOKENS_PER_TEAM: usize = 64;

/// Optional expiring-token bookkeeping layer (§4.1, §3 invariant I5).
pub struct TokenStore {
    by_team: tokio::sync::Mutex<BTreeMap<String, Vec<ExpiringToken>>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            by_team: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Issue a token binding `{tokenId, issuedAt, expiresAt, teamSlug}` folded
    /// into the signed parameter map. Evicts the oldest live token for the
    /// team when `maxTokensPerTeam` would be exceeded.
    pub async fn issue(
        &self,
        clock: &dyn Clock,
        rng: &dyn Rng,
        team_slug: &str,
        password: &str,
        mut params: Params,
        ttl: chrono::Duration,
    ) -> ExpiringToken {
        let now = clock.now();
        let token_id = rng.new_id();
        let expires_at = now + ttl;
        params.insert("TokenId".to_string(), ParamValue::Str(token_id.clone()));
        params.insert("IssuedAt".to_string(), ParamValue::Timestamp(now));
        params.insert("ExpiresAt".to_string(), ParamValue::Timestamp(expires_at));
        params.insert("TeamSlug".to_string(), ParamValue::Str(team_slug.to_string()));

        let signature = sign(&params, password);
        let refresh_token = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rng.random_bytes(32))
        };

        let original_params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.canonical_string()))
            .collect();

        let token = ExpiringToken {
            token_id,
            team_slug: team_slug.to_string(),
            token: signature,
            refresh_token: Some(refresh_token),
            issued_at: now,
            expires_at,
            last_used_at: None,
            original_params,
        };

        let mut guard = self.by_team.lock().await;
        let entry = guard.entry(team_slug.to_string()).or_default();
        entry.retain(|t| t.expires_at > now);
        while entry.len() >= MAX_TOKENS_PER_TEAM {
            entry.remove(0); // oldest-first: Vec is append-ordered
        }
        entry.push(token.clone());
        token
    }

    /// Validate an expiring token, additionally checking expiry.
    pub async fn validate(&self, clock: &dyn Clock, team_slug: &str, token: &str) -> GatewayResult<()> {
        let guard = self.by_team.lock().await;
        let Some(entry) = guard.get(team_slug) else {
            return Err(GatewayError::TokenInvalid);
        };
        let Some(found) = entry.iter().find(|t| ct_eq(t.token.as_bytes(), token.as_bytes())) else {
            return Err(GatewayError::TokenInvalid);
        };
        if found.expires_at <= clock.now() {
            return Err(GatewayError::TokenExpired);
        }
        Ok(())
    }

    /// Refresh a token, looking up the real team secret before re-signing
    /// rather than reusing a cached or placeholder value.
    pub async fn refresh(
        &self,
        clock: &dyn Clock,
        rng: &dyn Rng,
        teams: &dyn TeamRegistry,
        team_slug: &str,
        refresh_token: &str,
        ttl: chrono::Duration,
    ) -> GatewayResult<ExpiringToken> {
        let team = teams.lookup_by_slug(team_slug).await?;
        let mut guard = self.by_team.lock().await;
        let entry = guard.entry(team_slug.to_string()).or_default();
        let idx = entry
            .iter()
            .position(|t| t.refresh_token.as_deref().is_some_and(|rt| ct_eq(rt.as_bytes(), refresh_token.as_bytes())))
            .ok_or(GatewayError::TokenInvalid)?;
        let old = entry.remove(idx); // revoked on use
        drop(guard);

        let mut params: Params = old
            .original_params
            .into_iter()
            .filter(|(k, _)| !matches!(k.as_str(), "TokenId" | "IssuedAt" | "ExpiresAt" | "Password"))
            .map(|(k, v)| (k, ParamValue::Str(v)))
            .collect();
        params.insert("TeamSlug".to_string(), ParamValue::Str(team_slug.to_string()));

        Ok(self.issue(clock, rng, team_slug, &team.password, params, ttl).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with_amount() -> Params {
        let mut p = Params::new();
        p.insert("TeamSlug".into(), ParamValue::Str("acme".into()));
        p.insert("PaymentId".into(), ParamValue::Str("P".into()));
        p.insert("Amount".into(), ParamValue::Int(100));
        p
    }

    fn params_status_lookup() -> Params {
        let mut p = Params::new();
        p.insert("TeamSlug".into(), ParamValue::Str("acme".into()));
        p.insert("PaymentId".into(), ParamValue::Str("P".into()));
        p
    }

    #[test]
    fn status_lookup_quirk_matches_fixed_sequence() {
        let expected = crate::crypto::sha256_hex(b"Ppwacme");
        assert_eq!(sign(&params_status_lookup(), "pw"), expected);
    }

    #[test]
    fn lexicographic_order_used_when_amount_present() {
        // Amount, Password, PaymentId, TeamSlug
        let expected = crate::crypto::sha256_hex(b"100pwPacme");
        assert_eq!(sign(&params_with_amount(), "pw"), expected);
    }

    #[test]
    fn token_key_is_always_excluded() {
        let mut with_token = params_status_lookup();
        with_token.insert("Token".into(), ParamValue::Str("ignored".into()));
        let mut without_token = params_status_lookup();
        without_token.remove("token");
        assert_eq!(sign(&with_token, "pw"), sign(&params_status_lookup(), "pw"));
        let _ = without_token;
    }

    #[test]
    fn signing_with_own_token_is_a_fixed_point() {
        let params = params_with_amount();
        let sig = sign(&params, "pw");
        let mut with_self_token = params.clone();
        with_self_token.insert("Token".into(), ParamValue::Str(sig.clone()));
        assert_eq!(sign(&with_self_token, "pw"), sig);
    }

    #[test]
    fn validate_rejects_mismatched_length() {
        let params = params_status_lookup();
        assert!(!validate(&params, "pw", "short"));
    }

    #[test]
    fn validate_accepts_correct_signature() {
        let params = params_status_lookup();
        let sig = sign(&params, "pw");
        assert!(validate(&params, "pw", &sig));
    }
}
