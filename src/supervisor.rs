//! Starts and stops the four components in dependency order, and owns the
//! shared background tasks (spec §4, §9): store cleanup, audit buffer
//! flush, policy reload.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::engine::CapabilityEngine;
use crate::error::CoreResult;
use crate::policy::PolicyEngine;
use crate::signer::Signer;
use crate::store::CapabilityStore;

/// A running agent core: the capability engine plus the background tasks
/// that keep the store, policy set and audit buffer healthy.
pub struct Supervisor {
    pub engine: Arc<CapabilityEngine>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Starts components in dependency order: signer, store, policy
    /// engine, audit log, then the orchestrating capability engine (spec
    /// §2 dependency table; §9: "Supervisor owns all four").
    pub fn start(config: AgentConfig) -> CoreResult<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock))
    }

    pub fn start_with_clock(config: AgentConfig, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let signer = Signer::load_or_generate(
            &config.signer.private_key_file,
            &config.signer.public_key_file,
            config.signer.auto_generate,
        )?;
        let audit_signer = if config.audit.enable_signature {
            Some(Signer::generate())
        } else {
            None
        };

        let store = CapabilityStore::new(config.store.clone(), Arc::clone(&clock))?;
        let policy = PolicyEngine::new(config.policy.clone(), Arc::clone(&clock))?;
        let audit = AuditLog::open(config.audit.clone(), Arc::clone(&clock), audit_signer)?;

        let engine = Arc::new(CapabilityEngine::new(
            config.engine.clone(),
            store,
            policy,
            audit,
            signer,
            Arc::clone(&clock),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(spawn_cleanup_task(
            Arc::clone(&engine),
            config.store.cleanup_interval,
            shutdown_rx.clone(),
        ));
        tasks.push(spawn_audit_flush_task(
            Arc::clone(&engine),
            config.audit.flush_interval,
            shutdown_rx.clone(),
        ));
        if config.policy.enable_reloading {
            tasks.push(spawn_policy_reload_task(
                Arc::clone(&engine),
                config.policy.reload_interval,
                shutdown_rx.clone(),
            ));
        }

        info!("supervisor started");
        Ok(Self {
            engine,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    /// Stops accepting new background work, drains in-flight tasks for up
    /// to `grace` before giving up, flushes audit, and persists the store
    /// (spec §5 shutdown). A flush failure during shutdown is logged, not
    /// propagated.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let join_all = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("background tasks did not drain within the shutdown grace window");
        }
        if let Err(e) = self.engine.flush_audit().await {
            warn!(error = %e, "audit flush failed during shutdown");
        }
        info!("supervisor stopped");
    }
}

fn spawn_cleanup_task(
    engine: Arc<CapabilityEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => engine.cleanup().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_audit_flush_task(
    engine: Arc<CapabilityEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = engine.flush_audit().await {
                        warn!(error = %e, "scheduled audit flush failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_policy_reload_task(
    engine: Arc<CapabilityEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = engine.reload_policies().await {
                        warn!(error = %e, "scheduled policy reload failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, EngineConfig, PolicyEngineConfig, SignerConfig, StoreConfig};

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            signer: SignerConfig {
                private_key_file: dir.join("agent.key"),
                public_key_file: dir.join("agent.pub"),
                auto_generate: true,
                ..Default::default()
            },
            engine: EngineConfig::default(),
            store: StoreConfig {
                storage_file_path: dir.join("capabilities.json"),
                cleanup_interval: Duration::from_millis(20),
                ..Default::default()
            },
            policy: PolicyEngineConfig {
                directory: dir.join("policies"),
                enable_reloading: false,
                ..Default::default()
            },
            audit: AuditConfig {
                log_file_path: dir.join("audit.log"),
                flush_interval: Duration::from_millis(20),
                enable_signature: false,
                ..Default::default()
            },
            ipc: Default::default(),
        }
    }

    #[tokio::test]
    async fn starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::start(test_config(dir.path())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn policy_reload_task_picks_up_a_newly_written_policy() {
        use crate::capability::{CapabilityRequest, RequestStatus};
        use crate::policy::{write_policy_file, Policy, PolicyRule, PolicyStatus, RuleEffect};

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.policy.enable_reloading = true;
        config.policy.reload_interval = Duration::from_millis(20);
        let supervisor = Supervisor::start(config).unwrap();

        let request = CapabilityRequest {
            identity: "app1".into(),
            resource: "secret:/db/primary".into(),
            actions: vec!["read".into()],
            ttl: Some(60),
            ..Default::default()
        };
        let denied = supervisor.engine.request(request.clone(), Default::default()).await;
        assert_eq!(denied.status, RequestStatus::Denied);

        write_policy_file(
            &dir.path().join("policies"),
            &Policy {
                id: "allow-db".into(),
                name: "allow-db".into(),
                version: "1".into(),
                status: PolicyStatus::Active,
                rules: vec![PolicyRule {
                    id: "allow-read".into(),
                    effect: RuleEffect::Allow,
                    priority: 10,
                    resources: vec!["secret:/db/*".into()],
                    actions: vec!["*".into()],
                    identities: vec!["*".into()],
                    conditions: vec![],
                }],
                created_at: 0,
                updated_at: 0,
                author: None,
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let granted = supervisor.engine.request(request, Default::default()).await;
        assert_eq!(granted.status, RequestStatus::Granted);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }
}
