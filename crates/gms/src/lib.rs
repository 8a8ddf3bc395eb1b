//! Group membership service
//!
//! This crate maintains a consistent, ordered view of which nodes form a
//! cluster:
//! - Joining nodes discover the cluster and are admitted by its coordinator
//! - The coordinator, always the first member of the view, broadcasts every
//!   membership change and waits for acknowledgements
//! - Failed or departing members are removed and a new coordinator takes
//!   over when the old one disappears
//! - Sub-clusters that formed during a partition are merged once they see
//!   each other again
//!
//! The transport below and the application above are pluggable through
//! [`GmsTransport`] and [`Application`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Node addresses
pub mod address;

/// Builder for the membership service
pub mod builder;

/// Configuration types
pub mod config;

/// Sequence-number digests
pub mod digest;

/// Discovery responses and coordinator election
pub mod discovery;

/// Error types
pub mod error;

/// Membership service engine
pub(crate) mod gms;

/// Ordered member lists
pub mod membership;

/// Protocol headers
pub mod messages;

/// Deployment topology rules
pub mod policy;

/// Reply collectors
pub mod promise;

/// Membership roles
pub mod roles;

/// Collaborator interfaces
pub mod transport;

/// Views and view identifiers
pub mod view;

pub use {
    address::Address,
    builder::{DEFAULT_SUBGROUP, GmsBuilder},
    config::GmsConfig,
    digest::{Digest, DigestEntry},
    discovery::PingResponse,
    error::{GmsError, GmsResult},
    gms::Gms,
    membership::Membership,
    messages::{GmsHeader, GmsMessage, JoinResponse, JoinResult, MergeData, MergeId},
    policy::{ReplicaPairTopology, StandardTopology, TopologyPolicy},
    roles::RoleKind,
    transport::{Application, GmsTransport, NodeStatus, TransportEvent},
    view::{HashDistribution, View, ViewId},
};
