//! capcore: capability issuance, policy evaluation and tamper-evident
//! auditing for a local security agent.
//!
//! A caller asks a [`CapabilityEngine`] for a capability ("can identity X
//! perform action Y on resource Z"); the engine consults a [`PolicyEngine`],
//! signs and persists the result in a [`CapabilityStore`], and appends an
//! entry to an [`AuditLog`]. [`Supervisor`] wires those four pieces together
//! and owns the background maintenance tasks (store cleanup, audit flush,
//! policy reload).
//!
//! Most callers only need [`Supervisor::start`] and the [`CapabilityEngine`]
//! it returns; the module-level types are exposed for embedding and testing.

pub mod audit;
pub mod capability;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod policy;
pub mod signer;
pub mod store;
pub mod supervisor;

pub use audit::{AuditEvent, AuditLog, AuditStats};
pub use capability::{Capability, CapabilityKind, CapabilityRequest, CapabilityResponse};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AgentConfig;
pub use engine::{CapabilityEngine, StatusResponse, ValidationContext, ValidationResult};
pub use error::{CoreError, CoreResult};
pub use policy::{Decision, Policy, PolicyEngine, PolicyStats};
pub use signer::Signer;
pub use store::{CapabilityStore, StoreStats};
pub use supervisor::Supervisor;
