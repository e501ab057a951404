//! foundry-services — registry, catalog, routing, job queue and admission.
//!
//! Everything here is I/O-facing but transport-agnostic: the HTTP surfaces
//! live in foundry-api and only call into these types.

pub mod admission;
pub mod background;
pub mod catalog;
pub mod notify;
pub mod packager;
pub mod queue;
pub mod registry;
pub mod selection;
pub mod store;

pub use admission::{AdmissionError, AdmissionSettings, JobAdmissionController};
pub use catalog::ServiceCatalog;
pub use registry::{RegistryEntry, ServiceRegistry};
pub use selection::{AgentRouter, RouteError};
