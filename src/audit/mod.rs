//! The audit log (spec §4.5): an append-only, hash-chained, buffered event
//! stream with rotation and optional signing.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::capability::ContextMap;
use crate::clock::{Clock, IdGenerator};
use crate::config::AuditConfig;
use crate::error::{CoreError, CoreResult};
use crate::signer::Signer;

/// Seeds `previous.chain_hash` for the first event in a log (spec §4.5
/// step 4: "the bootstrap previous value is a fixed constant documented in
/// configuration").
pub const CHAIN_GENESIS: &[u8] = b"capcore-audit-genesis-v1";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CapabilityRequest,
    CapabilityValidate,
    CapabilityRevoke,
    PolicyEvaluation,
    Security,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Granted,
    Denied,
    Success,
    Failed,
    Error,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Peer information supplied by the (out-of-scope) IPC layer, carried
/// through into the audit record for forensics (spec §3 `client_info`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub source_ip: Option<String>,
    pub platform: Option<String>,
    pub pid: Option<u32>,
    pub container: Option<String>,
}

/// An append-only, hash-chained audit record (spec §3 `AuditEvent`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub category: String,
    pub severity: Severity,
    pub source_identity: String,
    pub target_resource: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub capability_id: Option<String>,
    pub policy_id: Option<String>,
    pub request_id: Option<String>,
    pub client_info: ClientInfo,
    #[serde(default)]
    pub context: ContextMap,
    pub hash: String,
    pub chain_hash: String,
    #[serde(default, with = "opt_signature_bytes")]
    pub signature: Option<Signature>,
}

mod opt_signature_bytes {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Option<Signature>, s: S) -> Result<S::Ok, S::Error> {
        match sig {
            Some(sig) => s.serialize_some(&hex::encode(sig.to_bytes())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Signature>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        match opt {
            None => Ok(None),
            Some(hexstr) => {
                let bytes = hex::decode(hexstr).map_err(serde::de::Error::custom)?;
                let arr: [u8; 64] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
                Ok(Some(Signature::from_bytes(&arr)))
            }
        }
    }
}

/// Unsigned, unhashed fields a caller supplies to append an event; the
/// writer fills in `id`/`timestamp`/`hash`/`chain_hash`/`signature`.
#[derive(Clone, Debug, Default)]
pub struct AuditEventDraft {
    pub event_type_str: Option<AuditEventType>,
    pub category: String,
    pub severity: Severity,
    pub source_identity: String,
    pub target_resource: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub capability_id: Option<String>,
    pub policy_id: Option<String>,
    pub request_id: Option<String>,
    pub client_info: ClientInfo,
    pub context: ContextMap,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Default for AuditOutcome {
    fn default() -> Self {
        AuditOutcome::Success
    }
}

#[derive(Serialize)]
struct HashableEvent<'a> {
    id: &'a str,
    timestamp: i64,
    event_type: AuditEventType,
    category: &'a str,
    severity: Severity,
    source_identity: &'a str,
    target_resource: &'a str,
    action: &'a str,
    outcome: AuditOutcome,
    capability_id: &'a Option<String>,
    policy_id: &'a Option<String>,
    request_id: &'a Option<String>,
    context: &'a ContextMap,
}

fn compute_hash(event: &HashableEvent) -> String {
    let bytes = serde_json::to_vec(event).expect("audit event is always serializable");
    blake3::hash(&bytes).to_hex().to_string()
}

fn compute_chain_hash(hash: &str, previous_chain_hash: &str) -> String {
    let mut buf = Vec::with_capacity(hash.len() + previous_chain_hash.len());
    buf.extend_from_slice(hash.as_bytes());
    buf.extend_from_slice(previous_chain_hash.as_bytes());
    blake3::hash(&buf).to_hex().to_string()
}

fn genesis_chain_hash() -> String {
    blake3::hash(CHAIN_GENESIS).to_hex().to_string()
}

struct WriterState {
    file: File,
    bytes_written: u64,
    last_chain_hash: String,
    buffer: VecDeque<AuditEvent>,
    degraded: bool,
}

/// Hash-chained, buffered event writer (spec §4.5).
pub struct AuditLog {
    config: AuditConfig,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    signer: Option<Signer>,
    state: Mutex<WriterState>,
}

impl AuditLog {
    pub fn open(config: AuditConfig, clock: Arc<dyn Clock>, signer: Option<Signer>) -> CoreResult<Self> {
        if let Some(parent) = config.log_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| CoreError::AuditWrite(format!("failed to create audit directory: {e}")))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file_path)
            .map_err(|e| CoreError::AuditWrite(format!("failed to open audit log: {e}")))?;
        let bytes_written = file
            .metadata()
            .map_err(|e| CoreError::AuditWrite(format!("failed to stat audit log: {e}")))?
            .len();
        let last_chain_hash = last_chain_hash_of(&config.log_file_path).unwrap_or_else(genesis_chain_hash);

        Ok(Self {
            ids: IdGenerator,
            state: Mutex::new(WriterState {
                file,
                bytes_written,
                last_chain_hash,
                buffer: VecDeque::new(),
                degraded: false,
            }),
            signer,
            clock,
            config,
        })
    }

    /// Appends `draft` to the buffer (or writes it directly when buffering
    /// is disabled), assigning id/timestamp/hash/chain_hash/signature.
    #[instrument(skip(self, draft))]
    pub async fn append(&self, draft: AuditEventDraft) -> CoreResult<AuditEvent> {
        let mut state = self.state.lock().await;
        let id = self.ids.generate_prefixed("audit");
        let timestamp = self.clock.now_unix();
        let event_type = draft.event_type_str.unwrap_or(AuditEventType::Security);

        let hash = compute_hash(&HashableEvent {
            id: &id,
            timestamp,
            event_type,
            category: &draft.category,
            severity: draft.severity,
            source_identity: &draft.source_identity,
            target_resource: &draft.target_resource,
            action: &draft.action,
            outcome: draft.outcome,
            capability_id: &draft.capability_id,
            policy_id: &draft.policy_id,
            request_id: &draft.request_id,
            context: &draft.context,
        });
        let chain_hash = compute_chain_hash(&hash, &state.last_chain_hash);
        let signature = if self.config.enable_signature {
            self.signer.as_ref().map(|s| s.sign(chain_hash.as_bytes()))
        } else {
            None
        };

        let event = AuditEvent {
            id,
            timestamp,
            event_type,
            category: draft.category,
            severity: draft.severity,
            source_identity: draft.source_identity,
            target_resource: draft.target_resource,
            action: draft.action,
            outcome: draft.outcome,
            capability_id: draft.capability_id,
            policy_id: draft.policy_id,
            request_id: draft.request_id,
            client_info: draft.client_info,
            context: draft.context,
            hash,
            chain_hash: chain_hash.clone(),
            signature,
        };
        state.last_chain_hash = chain_hash;

        if self.config.enable_buffer {
            state.buffer.push_back(event.clone());
            let should_flush = state.buffer.len() >= self.config.buffer_size;
            if should_flush {
                self.flush_locked(&mut state)?;
            }
        } else {
            self.write_event(&mut state, &event)?;
        }
        Ok(event)
    }

    /// Flushes any buffered events to disk. Every flush is atomic with
    /// respect to other flushes because it runs under the single writer
    /// lock (spec §4.5 step 7).
    pub async fn flush(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WriterState) -> CoreResult<()> {
        let pending: Vec<AuditEvent> = state.buffer.drain(..).collect();
        for event in &pending {
            if let Err(e) = self.write_event(state, event) {
                // Put unwritten events back at the front, mark degraded,
                // and surface the error rather than dropping them.
                for ev in pending.into_iter().rev() {
                    state.buffer.push_front(ev);
                }
                state.degraded = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn write_event(&self, state: &mut WriterState, event: &AuditEvent) -> CoreResult<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| CoreError::AuditWrite(format!("failed to serialize event: {e}")))?;
        line.push(b'\n');

        if self.config.enable_rotation && state.bytes_written + line.len() as u64 > self.config.max_file_size {
            self.rotate(state)?;
        }

        state
            .file
            .write_all(&line)
            .map_err(|e| CoreError::AuditWrite(format!("failed to write audit event: {e}")))?;
        state
            .file
            .flush()
            .map_err(|e| CoreError::AuditWrite(format!("failed to flush audit log: {e}")))?;
        state.bytes_written += line.len() as u64;
        state.degraded = false;
        Ok(())
    }

    fn rotate(&self, state: &mut WriterState) -> CoreResult<()> {
        let path = &self.config.log_file_path;
        // Shift existing backups up by one, oldest dropped past the cap.
        for i in (1..self.config.max_backup_files).rev() {
            let src = backup_path(path, i);
            let dst = backup_path(path, i + 1);
            if src.exists() {
                let _ = fs::rename(&src, &dst);
            }
        }
        let first_backup = backup_path(path, 1);
        let oldest = backup_path(path, self.config.max_backup_files + 1);
        if oldest.exists() {
            let _ = fs::remove_file(&oldest);
        }
        fs::rename(path, &first_backup)
            .map_err(|e| CoreError::AuditWrite(format!("failed to rotate audit log: {e}")))?;

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CoreError::AuditWrite(format!("failed to reopen audit log: {e}")))?;
        state.file = new_file;
        state.bytes_written = 0;
        Ok(())
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Snapshot consumed by `status_request` (SPEC_FULL §B).
    pub async fn stats(&self) -> AuditStats {
        let state = self.state.lock().await;
        AuditStats {
            pending_events: state.buffer.len(),
            degraded: state.degraded,
            bytes_written: state.bytes_written,
        }
    }
}

/// Aggregate health snapshot returned by [`AuditLog::stats`].
#[derive(Clone, Debug, Default)]
pub struct AuditStats {
    pub pending_events: usize,
    pub degraded: bool,
    pub bytes_written: u64,
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn last_chain_hash_of(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let last_line = contents.lines().last()?;
    let event: AuditEvent = serde_json::from_str(last_line).ok()?;
    Some(event.chain_hash)
}

/// Verifies the hash chain of a sequence of events read back from disk
/// (spec §8: `e_i.chain_hash == H(e_i.hash || e_{i-1}.chain_hash)`).
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), usize> {
    let mut previous = genesis_chain_hash();
    for (i, event) in events.iter().enumerate() {
        let expected = compute_chain_hash(&event.hash, &previous);
        if expected != event.chain_hash {
            return Err(i);
        }
        previous = event.chain_hash.clone();
    }
    Ok(())
}

pub fn read_events(path: &Path) -> CoreResult<Vec<AuditEvent>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::AuditWrite(format!("failed to read audit log: {e}"))),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| CoreError::AuditWrite(format!("corrupt audit line: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn draft(category: &str) -> AuditEventDraft {
        AuditEventDraft {
            event_type_str: Some(AuditEventType::CapabilityRequest),
            category: category.to_string(),
            severity: Severity::Info,
            source_identity: "app1".into(),
            target_resource: "res".into(),
            action: "read".into(),
            outcome: AuditOutcome::Granted,
            ..Default::default()
        }
    }

    async fn log_at(dir: &Path, buffer: bool) -> AuditLog {
        let config = AuditConfig {
            log_file_path: dir.join("audit.log"),
            enable_buffer: buffer,
            buffer_size: 2,
            enable_signature: false,
            ..Default::default()
        };
        AuditLog::open(config, Arc::new(FixedClock::new(1_000)), None).unwrap()
    }

    #[tokio::test]
    async fn unbuffered_writes_are_immediately_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_at(dir.path(), false).await;
        log.append(draft("issue")).await.unwrap();
        let events = read_events(&dir.path().join("audit.log")).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn buffered_writes_flush_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_at(dir.path(), true).await;
        log.append(draft("a")).await.unwrap();
        assert_eq!(read_events(&dir.path().join("audit.log")).unwrap().len(), 0);
        log.append(draft("b")).await.unwrap();
        assert_eq!(read_events(&dir.path().join("audit.log")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chain_is_well_formed_and_tamper_evident() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_at(dir.path(), false).await;
        for i in 0..5 {
            log.append(draft(&format!("event{i}"))).await.unwrap();
        }
        let mut events = read_events(&dir.path().join("audit.log")).unwrap();
        assert!(verify_chain(&events).is_ok());

        events[2].hash = "tampered".to_string();
        assert_eq!(verify_chain(&events), Err(2));
    }

    #[tokio::test]
    async fn flush_is_explicit_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_at(dir.path(), true).await;
        log.append(draft("a")).await.unwrap();
        log.flush().await.unwrap();
        log.flush().await.unwrap();
        assert_eq!(read_events(&dir.path().join("audit.log")).unwrap().len(), 1);
        assert_eq!(log.pending_count().await, 0);
    }
}
