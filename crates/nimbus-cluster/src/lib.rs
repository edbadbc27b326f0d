//! Cluster lifecycle for nimbus
//!
//! The [`Provisioner`] drives a cluster through provisioning, upgrades,
//! scaling, repair, credential rotation, backups and teardown. The
//! [`Reconciler`] periodically repairs running clusters that report
//! unhealthy.
//!
//! Related crates:
//! - `nimbus-common`: data model, collaborator contracts, in-memory backends
//! - `nimbus-executor`: running commands on nodes
//! - `nimbus-operator`: job-queue worker and process entry point

pub mod bootstrap;
pub mod controller;
pub mod guard;
pub mod ha;
pub mod kubeconfig;
pub mod phases;
pub mod reconciler;
pub mod security;
pub mod transport;

pub use controller::{Context, ContextBuilder, Provisioner, ProvisionerConfig};
pub use guard::{BusyGuard, BusySet};
pub use phases::{DeprovisionReport, ScaleReport};
pub use reconciler::{Healer, ReconcileReport, Reconciler};

pub use nimbus_common::{Error, Result};
