//! Domain module - Core business logic and entities
//!
//! Entities mirrored from the directory, the pure reconciliation diff, the
//! deletion-history filter and the quota gate. Nothing here performs I/O
//! except through the collaborator traits in `repositories` and `remote`.

pub mod attachments;
pub mod entities;
pub mod pagination;
pub mod quota;
pub mod reconcile;
pub mod remote;
pub mod repositories;

pub use entities::{
    AttachmentEntry, AttachmentTombstone, CapabilityPool, Group, GroupGrant, Institution, RoleAssignment, User,
    UserGrant,
};
pub use quota::{PendingDemand, QuotaGate, QuotaViolation};
pub use reconcile::{plan_partition, LocalRecord, PartitionPlan, RemoteRecord};
pub use remote::{DirectoryApi, Page, RemoteGroup, RemoteInstitution, RemoteUser};
