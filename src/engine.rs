//! The capability engine (spec §4.4): orchestrates request validation,
//! policy evaluation, capability construction/signing/storage, and the
//! other three externally visible operations.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::audit::{AuditEventDraft, AuditEventType, AuditLog, AuditOutcome, AuditStats, ClientInfo, Severity};
use crate::capability::{
    Capability, CapabilityKind, CapabilityRequest, CapabilityResponse, ContextMap, RequestStatus,
};
use crate::clock::{Clock, IdGenerator};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::policy::{Decision, PolicyEngine, PolicyStats};
use crate::signer::Signer;
use crate::store::usage::AccessEvent;
use crate::store::{CapabilityStore, ListFilter, StoreStats};

/// Context the IPC layer attaches to a validate call (spec §4.4 step 6).
#[derive(Clone, Debug, Default)]
pub struct ValidationContext {
    pub source_ip: Option<String>,
    pub environment: ContextMap,
    pub client_info: ClientInfo,
}

/// Every reason a validate call failed, accumulated rather than
/// short-circuited (spec §4.4 "all applicable checks still run").
#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub capability: Option<Capability>,
}

/// Response to `status_request` (SPEC_FULL §B): store, policy and audit
/// stats snapshotted together, even though the IPC transport carrying this
/// response is itself out of scope.
#[derive(Clone, Debug, Default)]
pub struct StatusResponse {
    pub store: StoreStats,
    pub policy: PolicyStats,
    pub audit: AuditStats,
}

/// The capability engine. Holds references to the store, policy engine,
/// audit log and signer; it never exposes them directly (spec §9: "Audit
/// is a sink: never calls back into engine").
pub struct CapabilityEngine {
    config: EngineConfig,
    store: CapabilityStore,
    policy: PolicyEngine,
    audit: AuditLog,
    signer: Signer,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
}

impl CapabilityEngine {
    pub fn new(
        config: EngineConfig,
        store: CapabilityStore,
        policy: PolicyEngine,
        audit: AuditLog,
        signer: Signer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            policy,
            audit,
            signer,
            clock,
            ids: IdGenerator,
        }
    }

    /// Services `capability_request` (spec §4.4 steps 1-8).
    #[instrument(skip(self, request), fields(identity = %request.identity, resource = %request.resource))]
    pub async fn request(&self, request: CapabilityRequest, client_info: ClientInfo) -> CapabilityResponse {
        let start = Instant::now();
        let request_id = self.ids.generate_prefixed("req");

        if let Err(e) = request.validate_shape() {
            self.audit_request(
                &request,
                None,
                None,
                AuditOutcome::Error,
                Some(request_id.clone()),
                &client_info,
                e.to_string(),
            )
            .await;
            return self.denied_response(request_id, start, e, None);
        }

        let ttl = match self.resolve_ttl(request.ttl) {
            Ok(ttl) => ttl,
            Err(e) => {
                self.audit_request(
                    &request,
                    None,
                    None,
                    AuditOutcome::Error,
                    Some(request_id.clone()),
                    &client_info,
                    e.to_string(),
                )
                .await;
                return self.denied_response(request_id, start, e, None);
            }
        };
        let max_uses = match self.resolve_max_uses(request.max_uses) {
            Ok(v) => v,
            Err(e) => {
                self.audit_request(
                    &request,
                    None,
                    None,
                    AuditOutcome::Error,
                    Some(request_id.clone()),
                    &client_info,
                    e.to_string(),
                )
                .await;
                return self.denied_response(request_id, start, e, None);
            }
        };

        let mut eval_context = request.context.clone();
        if let Some(purpose) = &request.purpose {
            eval_context
                .entry("purpose".to_string())
                .or_insert_with(|| purpose.clone().into());
        }
        let policy_result = self.policy.evaluate(
            &request.identity,
            &request.resource,
            &request.actions,
            client_info.source_ip.as_deref(),
            &eval_context,
        );

        if policy_result.decision == Decision::Deny {
            self.audit_request(
                &request,
                None,
                Some(&policy_result),
                AuditOutcome::Denied,
                Some(request_id.clone()),
                &client_info,
                policy_result.reasoning.clone(),
            )
            .await;
            return self.denied_response(
                request_id,
                start,
                CoreError::PolicyDenied { reasoning: policy_result.reasoning.clone() },
                Some(policy_result.reasoning),
            );
        }

        let kind = CapabilityKind::derive(&request.actions);
        let issued_at = self.clock.now_unix();
        let id = self.ids.generate_prefixed("cap");

        let mut metadata = request.context.clone();
        if let Some(purpose) = &request.purpose {
            metadata.insert("purpose".to_string(), purpose.clone().into());
        }

        let mut capability = Capability {
            id: id.clone(),
            kind,
            resource: request.resource.clone(),
            actions: request.actions.clone(),
            identity: request.identity.clone(),
            issuer: self.config.issuer.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            ttl,
            max_uses,
            used_count: 0,
            constraints: request.constraints.clone(),
            metadata,
            signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64]),
            revocation: None,
        };

        let canonical = match capability.canonical_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.audit_request(
                    &request,
                    Some(kind),
                    Some(&policy_result),
                    AuditOutcome::Error,
                    Some(request_id.clone()),
                    &client_info,
                    e.to_string(),
                )
                .await;
                return self.denied_response(request_id, start, e, None);
            }
        };
        capability.signature = self.signer.sign(&canonical);

        if let Err(e) = self.store.store(capability.clone()).await {
            warn!(error = %e, "failed to store capability after signing");
            self.audit_request(
                &request,
                Some(kind),
                Some(&policy_result),
                AuditOutcome::Error,
                Some(request_id.clone()),
                &client_info,
                e.to_string(),
            )
            .await;
            return self.denied_response(request_id, start, e, None);
        }

        self.audit_request(
            &request,
            Some(kind),
            Some(&policy_result),
            AuditOutcome::Granted,
            Some(request_id.clone()),
            &client_info,
            policy_result.reasoning.clone(),
        )
        .await;

        info!(id = %capability.id, "capability granted");
        CapabilityResponse {
            request_id,
            status: RequestStatus::Granted,
            capability: Some(capability),
            error_code: None,
            reasoning: Some(policy_result.reasoning),
            processing_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Services `capability_validate` (spec §4.4): every applicable check
    /// runs regardless of earlier failures, so the caller sees every
    /// reason at once.
    #[instrument(skip(self, context))]
    pub async fn validate(&self, capability_id: &str, context: ValidationContext) -> ValidationResult {
        let capability = match self.store.retrieve(capability_id).await {
            Ok(cap) => cap,
            Err(_) => {
                self.emit_validation_event(capability_id, None, false, &context, "CAP_NOT_FOUND")
                    .await;
                return ValidationResult {
                    valid: false,
                    errors: vec!["CAP_NOT_FOUND".to_string()],
                    capability: None,
                };
            }
        };

        let mut errors = Vec::new();
        let now = self.clock.now_unix();

        match capability.verify_signature(&self.signer.public_key()) {
            Ok(true) => {}
            _ => errors.push("INVALID_SIGNATURE".to_string()),
        }
        if capability.is_expired(now) {
            errors.push("EXPIRED".to_string());
        }
        if capability.is_exhausted() {
            errors.push("USAGE_LIMIT_EXCEEDED".to_string());
        }
        if capability.is_revoked() {
            errors.push("REVOKED".to_string());
        }
        self.check_constraints(&capability, &context, now, &mut errors).await;

        let valid = errors.is_empty();
        if self.config.enable_usage_tracking {
            let event = AccessEvent {
                timestamp: now,
                action: capability.actions.first().cloned().unwrap_or_default(),
                resource: capability.resource.clone(),
                success: valid,
            };
            if let Err(e) = self.store.update_usage(capability_id, event, valid).await {
                warn!(error = %e, "failed to record usage");
            }
        }

        self.emit_validation_event(
            capability_id,
            Some(&capability),
            valid,
            &context,
            &errors.join(","),
        )
        .await;

        ValidationResult {
            valid,
            errors,
            capability: Some(capability),
        }
    }

    async fn check_constraints(
        &self,
        capability: &Capability,
        context: &ValidationContext,
        now: i64,
        errors: &mut Vec<String>,
    ) {
        let constraints = &capability.constraints;
        if !constraints.ip_addresses.is_empty() {
            match &context.source_ip {
                Some(ip) if constraints.ip_addresses.iter().any(|a| a == ip) => {}
                _ => errors.push("CONSTRAINT_VIOLATION:ip".to_string()),
            }
        }
        if !constraints.time_window.is_empty() && !constraints.time_window.allows(now) {
            errors.push("CONSTRAINT_VIOLATION:time_window".to_string());
        }
        for (key, expected) in &constraints.environment {
            let actual = context
                .environment
                .get(key)
                .map(|v| match v {
                    crate::capability::ContextValue::String(s) => s.clone(),
                    crate::capability::ContextValue::Int(i) => i.to_string(),
                    crate::capability::ContextValue::Bool(b) => b.to_string(),
                    crate::capability::ContextValue::List(l) => l.join(","),
                });
            if actual.as_deref() != Some(expected.as_str()) {
                errors.push(format!("CONSTRAINT_VIOLATION:environment:{key}"));
            }
        }
        if let Some(limit) = &constraints.rate_limit {
            // Recomputed from the persisted access ring each call (spec §9
            // open question: no separate bucket state is persisted).
            if let Ok(usage) = self.store.get_usage(&capability.id).await {
                if usage.uses_within(now, limit.window_seconds) >= limit.max_per_window {
                    errors.push("CONSTRAINT_VIOLATION:rate_limit".to_string());
                }
            }
        }
    }

    /// Services `capability_revoke` (spec §4.4).
    #[instrument(skip(self))]
    pub async fn revoke(&self, capability_id: &str, reason: String, revoked_by: String) -> CoreResult<()> {
        self.store.revoke(capability_id, reason.clone(), revoked_by.clone()).await?;
        let mut context = ContextMap::new();
        context.insert("reason".to_string(), reason.into());
        if let Err(e) = self
            .audit
            .append(AuditEventDraft {
                event_type_str: Some(AuditEventType::CapabilityRevoke),
                category: "capability".into(),
                severity: Severity::Warning,
                source_identity: revoked_by,
                target_resource: capability_id.to_string(),
                action: "revoke".into(),
                outcome: AuditOutcome::Success,
                capability_id: Some(capability_id.to_string()),
                context,
                ..Default::default()
            })
            .await
        {
            warn!(error = %e, "audit write failed for revocation");
        }
        Ok(())
    }

    /// Services `capability_list` (spec §4.4): delegates directly to the
    /// store; no audit event is required for a read-only listing.
    pub async fn list(&self, filter: &ListFilter) -> (Vec<Capability>, usize) {
        self.store.list(filter).await
    }

    /// Background cleanup (spec §4.4): errors are logged, never surfaced.
    pub async fn cleanup(&self) {
        match self.store.cleanup().await {
            Ok(n) if n > 0 => info!(purged = n, "cleanup removed expired/revoked capabilities"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cleanup failed"),
        }
    }

    pub async fn flush_audit(&self) -> CoreResult<()> {
        self.audit.flush().await
    }

    pub async fn audit_degraded(&self) -> bool {
        self.audit.is_degraded().await
    }

    /// Forces an immediate reload of the active policy set (spec §4.3:
    /// "Reload may be periodic (interval) or manual (explicit trigger)").
    pub async fn reload_policies(&self) -> CoreResult<()> {
        self.policy.reload()
    }

    /// Services `status_request` (SPEC_FULL §B): an aggregated snapshot of
    /// store, policy and audit health, including the audit degraded flag.
    pub async fn status(&self) -> StatusResponse {
        StatusResponse {
            store: self.store.stats().await,
            policy: self.policy.stats(),
            audit: self.audit.stats().await,
        }
    }

    /// Test hook: mutates a stored capability's signed fields without
    /// re-signing (spec §8 scenario 6, tamper detection).
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn tamper_expires_at(&self, id: &str, new_expires_at: i64) -> CoreResult<()> {
        self.store.tamper_expires_at(id, new_expires_at).await
    }

    fn resolve_ttl(&self, requested: Option<i64>) -> CoreResult<i64> {
        let ttl = requested.filter(|t| *t > 0).unwrap_or(self.config.default_ttl);
        if ttl > self.config.max_ttl || ttl <= 0 {
            return Err(CoreError::InvalidRequest(format!(
                "ttl {ttl} is out of range (0, {}]",
                self.config.max_ttl
            )));
        }
        Ok(ttl)
    }

    fn resolve_max_uses(&self, requested: Option<u64>) -> CoreResult<u64> {
        let max_uses = requested.filter(|m| *m > 0).unwrap_or(self.config.default_max_uses);
        if max_uses > self.config.max_uses {
            return Err(CoreError::InvalidRequest(format!(
                "max_uses {max_uses} exceeds configured maximum {}",
                self.config.max_uses
            )));
        }
        Ok(max_uses)
    }

    fn denied_response(
        &self,
        request_id: String,
        start: Instant,
        error: CoreError,
        reasoning: Option<String>,
    ) -> CapabilityResponse {
        let status = match &error {
            CoreError::PolicyDenied { .. } => RequestStatus::Denied,
            CoreError::InvalidRequest(_) => RequestStatus::Denied,
            _ => RequestStatus::Error,
        };
        CapabilityResponse {
            request_id,
            status,
            capability: None,
            error_code: Some(error.code().to_string()),
            reasoning: reasoning.or_else(|| Some(error.to_string())),
            processing_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn audit_request(
        &self,
        request: &CapabilityRequest,
        kind: Option<CapabilityKind>,
        policy_result: Option<&crate::policy::EvaluationResult>,
        outcome: AuditOutcome,
        request_id: Option<String>,
        client_info: &ClientInfo,
        reasoning: String,
    ) {
        let mut context = request.context.clone();
        context.insert("reasoning".to_string(), reasoning.into());
        if let Some(kind) = kind {
            context.insert("kind".to_string(), kind.to_string().into());
        }
        let policy_id = policy_result.and_then(|r| r.applied_policies.first().cloned());
        let draft = AuditEventDraft {
            event_type_str: Some(AuditEventType::CapabilityRequest),
            category: "capability".into(),
            severity: Severity::Info,
            source_identity: request.identity.clone(),
            target_resource: request.resource.clone(),
            action: request.actions.join(","),
            outcome,
            capability_id: None,
            policy_id,
            request_id,
            client_info: client_info.clone(),
            context,
        };
        if let Err(e) = self.audit.append(draft).await {
            warn!(error = %e, "audit write failed for capability request");
        }
    }

    async fn emit_validation_event(
        &self,
        capability_id: &str,
        capability: Option<&Capability>,
        valid: bool,
        context: &ValidationContext,
        errors: &str,
    ) {
        let mut ctx = context.environment.clone();
        if !errors.is_empty() {
            ctx.insert("errors".to_string(), errors.to_string().into());
        }
        let draft = AuditEventDraft {
            event_type_str: Some(AuditEventType::CapabilityValidate),
            category: "capability".into(),
            severity: if valid { Severity::Info } else { Severity::Warning },
            source_identity: capability.map(|c| c.identity.clone()).unwrap_or_default(),
            target_resource: capability.map(|c| c.resource.clone()).unwrap_or_default(),
            action: "validate".into(),
            outcome: if valid { AuditOutcome::Success } else { AuditOutcome::Failed },
            capability_id: Some(capability_id.to_string()),
            client_info: context.client_info.clone(),
            context: ctx,
            ..Default::default()
        };
        if let Err(e) = self.audit.append(draft).await {
            warn!(error = %e, "audit write failed for validation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{AuditConfig, PolicyEngineConfig, StoreConfig};
    use crate::policy::{write_policy_file, Policy, PolicyRule, PolicyStatus, RuleEffect};

    fn make_engine(dir: &std::path::Path, default_decision: crate::config::DefaultDecision) -> CapabilityEngine {
        let store_config = StoreConfig {
            storage_file_path: dir.join("store.json"),
            grace_period_seconds: 0,
            ..Default::default()
        };
        let policy_config = PolicyEngineConfig {
            directory: dir.join("policies"),
            default_decision,
            ..Default::default()
        };
        let audit_config = AuditConfig {
            log_file_path: dir.join("audit.log"),
            enable_buffer: false,
            enable_signature: false,
            ..Default::default()
        };
        let engine_config = EngineConfig::default();
        let signer = Signer::generate();

        let store = CapabilityStore::new(store_config, Arc::new(FixedClock::new(1_000))).unwrap();
        let policy = PolicyEngine::new(policy_config, Arc::new(FixedClock::new(1_000))).unwrap();
        let audit = AuditLog::open(audit_config, Arc::new(FixedClock::new(1_000)), None).unwrap();
        CapabilityEngine::new(engine_config, store, policy, audit, signer, Arc::new(FixedClock::new(1_000)))
    }

    fn allow_policy() -> Policy {
        Policy {
            id: "allow-app".into(),
            name: "allow-app".into(),
            version: "1".into(),
            status: PolicyStatus::Active,
            rules: vec![PolicyRule {
                id: "allow".into(),
                effect: RuleEffect::Allow,
                priority: 10,
                resources: vec!["secret:/db/*".into()],
                actions: vec!["*".into()],
                identities: vec!["app*".into()],
                conditions: vec![],
            }],
            created_at: 0,
            updated_at: 0,
            author: None,
        }
    }

    #[tokio::test]
    async fn happy_path_grants_and_signs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        write_policy_file(&dir.path().join("policies"), &allow_policy()).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(300),
            ..Default::default()
        };
        let response = engine.request(request, ClientInfo::default()).await;
        assert_eq!(response.status, RequestStatus::Granted);
        let cap = response.capability.unwrap();
        assert_eq!(cap.kind, CapabilityKind::Read);
        assert_eq!(cap.expires_at, cap.issued_at + 300);
    }

    #[tokio::test]
    async fn status_reports_store_and_policy_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        write_policy_file(&dir.path().join("policies"), &allow_policy()).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(300),
            ..Default::default()
        };
        engine.request(request, ClientInfo::default()).await;

        let status = engine.status().await;
        assert_eq!(status.store.active, 1);
        assert_eq!(status.policy.loaded_policies, 1);
        assert!(!status.audit.degraded);
    }

    #[tokio::test]
    async fn policy_denial_blocks_issuance() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/prod/keys".into(),
            actions: vec!["read".into()],
            ttl: Some(60),
            ..Default::default()
        };
        let response = engine.request(request, ClientInfo::default()).await;
        assert_eq!(response.status, RequestStatus::Denied);
        assert!(response.capability.is_none());
    }

    #[tokio::test]
    async fn ttl_over_max_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        write_policy_file(&dir.path().join("policies"), &allow_policy()).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(10_000_000),
            ..Default::default()
        };
        let response = engine.request(request, ClientInfo::default()).await;
        assert_eq!(response.status, RequestStatus::Denied);
        assert_eq!(response.error_code.as_deref(), Some("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn revoke_then_validate_fails_with_revoked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        write_policy_file(&dir.path().join("policies"), &allow_policy()).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(300),
            ..Default::default()
        };
        let response = engine.request(request, ClientInfo::default()).await;
        let cap = response.capability.unwrap();

        engine.revoke(&cap.id, "test".into(), "admin".into()).await.unwrap();
        let result = engine.validate(&cap.id, ValidationContext::default()).await;
        assert!(!result.valid);
        assert!(result.errors.contains(&"REVOKED".to_string()));
    }

    #[tokio::test]
    async fn ip_constraint_violation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policies")).unwrap();
        write_policy_file(&dir.path().join("policies"), &allow_policy()).unwrap();
        let engine = make_engine(dir.path(), crate::config::DefaultDecision::Deny);

        let mut request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(300),
            ..Default::default()
        };
        request.constraints.ip_addresses = vec!["10.0.0.1".into()];
        let response = engine.request(request, ClientInfo::default()).await;
        let cap = response.capability.unwrap();

        let context = ValidationContext {
            source_ip: Some("10.0.0.2".into()),
            ..Default::default()
        };
        let result = engine.validate(&cap.id, context).await;
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.starts_with("CONSTRAINT_VIOLATION")));
    }
}
