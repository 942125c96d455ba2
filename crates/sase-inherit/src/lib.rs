//! Contract Inheritance Controller
//!
//! Keeps the contract relations of routed-network endpoint groups in
//! line with their subnet containment hierarchy: a child group whose
//! subnets fall inside a parent's subnets mirrors the parent's provided
//! and consumed contracts, subject to per-group inheritance policy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     InheritanceController                        │
//! │                                                                  │
//! │  feed ──► EventMonitor ──► Debouncer ──► WorkQueue ──► workers   │
//! │                                             ▲             │      │
//! │  ingest_config ──► PolicyStore ─────────────┘             │      │
//! │                                                           ▼      │
//! │          ┌────────────┐   ┌──────────┐   ┌────────────┐         │
//! │ fetch ──►│  Topology  │──►│ Resolver │──►│ Reconciler │──► push │
//! │          └────────────┘   └──────────┘   └────────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inherited relations carry a provenance tag listing the parents that
//! justify them; relations without a tag belong to the operator and are
//! never modified.

pub mod config;
pub mod controller;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod model;
pub mod monitor;
pub mod policy;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod retry;
pub mod topology;
pub mod worker;

pub use config::{ConnectionConfig, ControllerSettings, InheritConfig, PolicyEntry};
pub use controller::{ControllerStatus, InheritanceController};
pub use error::{InheritError, Result};
pub use fabric::{ChangedObject, FabricClient, FabricEvent, ItemOutcome, PushReport};
pub use memory::InMemoryFabric;
pub use model::{
    ContainerKind, ContainerRef, GroupId, InsideGroup, OutsideGroup, ProvenanceTag, RelationKey,
    RelationKind, ScopeId, ScopeSnapshot,
};
pub use policy::{InheritancePolicy, PolicyMap, PolicyStore};
pub use reconciler::{ChangeAction, Delta, RelationChange};
pub use retry::RetryPolicy;
pub use worker::{compute_delta, PassReport, ScopeWorker};
