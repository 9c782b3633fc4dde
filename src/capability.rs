//! The capability data model (spec §3): a signed, short-lived bearer token
//! plus the request/response shapes used to mint one.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::signer::Signer;

/// A bounded, ordered catalogue of scalar metadata values (spec §9: "use a
/// tagged variant for known fields plus a catch-all map from strings to a
/// bounded value type"). Used for both `metadata` and evaluation context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContextValue {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::String(s)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

pub type ContextMap = BTreeMap<String, ContextValue>;

/// The coarse category a capability falls into, derived from its action set
/// (spec §4.4 step 3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("delete")]
    Delete,
    #[display("execute")]
    Execute,
    #[display("admin")]
    Admin,
}

impl CapabilityKind {
    /// Ordered derivation rule from spec §4.4 step 3.
    pub fn derive(actions: &[String]) -> Self {
        let has = |names: &[&str]| {
            actions
                .iter()
                .any(|a| names.iter().any(|n| a.eq_ignore_ascii_case(n)))
        };
        if has(&["admin", "*"]) {
            CapabilityKind::Admin
        } else if has(&["delete"]) {
            CapabilityKind::Delete
        } else if has(&["write", "create", "update"]) {
            CapabilityKind::Write
        } else if has(&["execute", "run"]) {
            CapabilityKind::Execute
        } else {
            CapabilityKind::Read
        }
    }
}

/// Weekday index, Monday = 0, matching `chrono`'s `Weekday::num_days_from_monday`
/// convention without pulling in a date/time crate for a single enum.
pub type Weekday = u8;

/// A half-open blackout interval in unix seconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlackoutInterval {
    pub start: i64,
    pub end: i64,
}

/// A time-of-use constraint (spec §3, §4.4 step 6).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    /// Allowed hours of day, 0-23, UTC. Empty means unconstrained.
    #[serde(default)]
    pub hours: Vec<u8>,
    /// Allowed weekdays, 0-6 (Monday = 0). Empty means unconstrained.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    /// Intervals during which use is forbidden even if the hour/weekday
    /// checks pass.
    #[serde(default)]
    pub blackout: Vec<BlackoutInterval>,
}

impl TimeWindow {
    pub fn is_empty(&self) -> bool {
        self.hours.is_empty() && self.weekdays.is_empty() && self.blackout.is_empty()
    }

    /// `now` must be inside every non-empty sub-constraint.
    pub fn allows(&self, now_unix: i64) -> bool {
        if !self.hours.is_empty() {
            let hour = ((now_unix.rem_euclid(86_400)) / 3_600) as u8;
            if !self.hours.contains(&hour) {
                return false;
            }
        }
        if !self.weekdays.is_empty() {
            // 1970-01-01 was a Thursday (weekday index 3, Monday = 0).
            let days_since_epoch = now_unix.div_euclid(86_400);
            let weekday = ((days_since_epoch + 3).rem_euclid(7)) as u8;
            if !self.weekdays.contains(&weekday) {
                return false;
            }
        }
        for interval in &self.blackout {
            if now_unix >= interval.start && now_unix < interval.end {
                return false;
            }
        }
        true
    }
}

/// Additional runtime conditions a capability must satisfy at use time,
/// beyond whatever policy approved at issuance (spec §3, §4.4 step 6).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub time_window: TimeWindow,
    /// Exact `key = value` requirements against the validation-time runtime
    /// context.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl Constraints {
    pub fn is_default(&self) -> bool {
        self.ip_addresses.is_empty()
            && self.time_window.is_empty()
            && self.environment.is_empty()
            && self.rate_limit.is_none()
    }
}

/// A sliding-window rate limit enforced from the usage access ring (spec
/// §4.4 step 6, §9 open question: no separate persisted bucket state).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_per_window: u32,
    pub window_seconds: i64,
}

/// Annotation recording that a capability has been revoked, stored
/// alongside the signed record but never part of the signed bytes
/// (spec §3: "Revocation state is stored as an annotation").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Revocation {
    pub revoked_at: i64,
    pub revoked_by: String,
    pub reason: String,
}

/// The subset of a capability's fields that are actually signed over,
/// in the exact field order spec §4.1 mandates. `used_count` is always
/// zero here regardless of the live record's current usage.
#[derive(Serialize)]
struct SignablePayload<'a> {
    id: &'a str,
    kind: CapabilityKind,
    resource: &'a str,
    actions: &'a [String],
    identity: &'a str,
    issuer: &'a str,
    issued_at: i64,
    expires_at: i64,
    ttl: i64,
    max_uses: u64,
    used_count: u64,
    metadata: &'a ContextMap,
    constraints: &'a Constraints,
}

/// A signed, short-lived bearer token authorizing a bounded set of actions
/// on a named resource (spec §3).
#[derive(Clone, derive_more::Debug, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub id: String,
    pub kind: CapabilityKind,
    pub resource: String,
    pub actions: Vec<String>,
    pub identity: String,
    pub issuer: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub ttl: i64,
    pub max_uses: u64,
    pub used_count: u64,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub metadata: ContextMap,
    #[serde(with = "signature_bytes")]
    #[debug("{}", hex::encode(signature.to_bytes()))]
    pub signature: Signature,
    #[serde(default)]
    pub revocation: Option<Revocation>,
}

mod signature_bytes {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&sig.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature::from_bytes(&arr))
    }
}

impl Capability {
    fn signable(&self) -> SignablePayload<'_> {
        SignablePayload {
            id: &self.id,
            kind: self.kind,
            resource: &self.resource,
            actions: &self.actions,
            identity: &self.identity,
            issuer: &self.issuer,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            ttl: self.ttl,
            max_uses: self.max_uses,
            used_count: 0,
            metadata: &self.metadata,
            constraints: &self.constraints,
        }
    }

    /// Computes the canonical signing bytes for this capability, excluding
    /// its own `signature` field (spec §4.1).
    pub fn canonical_bytes(&self) -> CoreResult<Vec<u8>> {
        Signer::canonical(&self.signable())
    }

    /// Verifies that `self.signature` matches the issuer's public key over
    /// this capability's current canonical bytes.
    pub fn verify_signature(&self, issuer_public_key: &VerifyingKey) -> CoreResult<bool> {
        let bytes = self.canonical_bytes()?;
        Ok(Signer::verify(issuer_public_key, &bytes, &self.signature))
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.max_uses
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }
}

/// A request to mint a new capability (spec §6.1 `capability_request`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub identity: String,
    pub resource: String,
    pub actions: Vec<String>,
    pub ttl: Option<i64>,
    pub max_uses: Option<u64>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub context: ContextMap,
    pub purpose: Option<String>,
}

impl CapabilityRequest {
    /// Shape validation from spec §4.4 step 1, independent of TTL/max-uses
    /// bound checks which need engine configuration.
    pub fn validate_shape(&self) -> CoreResult<()> {
        if self.identity.trim().is_empty() {
            return Err(CoreError::InvalidRequest("identity must not be empty".into()));
        }
        if self.resource.trim().is_empty() {
            return Err(CoreError::InvalidRequest("resource must not be empty".into()));
        }
        if self.actions.is_empty() {
            return Err(CoreError::InvalidRequest("actions must not be empty".into()));
        }
        Ok(())
    }
}

/// The status of a `capability_request` response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Granted,
    Denied,
    Error,
}

/// Response to a `capability_request` (spec §6.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub request_id: String,
    pub status: RequestStatus,
    pub capability: Option<Capability>,
    pub error_code: Option<String>,
    pub reasoning: Option<String>,
    pub processing_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_derivation_order() {
        assert_eq!(
            CapabilityKind::derive(&["read".into(), "admin".into()]),
            CapabilityKind::Admin
        );
        assert_eq!(
            CapabilityKind::derive(&["read".into(), "delete".into()]),
            CapabilityKind::Delete
        );
        assert_eq!(
            CapabilityKind::derive(&["read".into(), "write".into()]),
            CapabilityKind::Write
        );
        assert_eq!(CapabilityKind::derive(&["run".into()]), CapabilityKind::Execute);
        assert_eq!(CapabilityKind::derive(&["read".into()]), CapabilityKind::Read);
        assert_eq!(CapabilityKind::derive(&["*".into()]), CapabilityKind::Admin);
    }

    #[test]
    fn time_window_blackout() {
        let tw = TimeWindow {
            hours: vec![],
            weekdays: vec![],
            blackout: vec![BlackoutInterval { start: 100, end: 200 }],
        };
        assert!(tw.allows(50));
        assert!(!tw.allows(150));
        assert!(tw.allows(200));
    }

    #[test]
    fn request_shape_validation_rejects_empty_fields() {
        let mut req = CapabilityRequest {
            identity: "".into(),
            resource: "res".into(),
            actions: vec!["read".into()],
            ..Default::default()
        };
        assert!(req.validate_shape().is_err());
        req.identity = "app1".into();
        assert!(req.validate_shape().is_ok());
    }
}
