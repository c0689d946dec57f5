//! Upstream clients for the meshguard control plane
//!
//! Three collaborators live here: the external time-series store the
//! monitor polls, the alert webhook sink other systems push into, and the
//! charter service the executor drives remediation through.

pub mod alerts;
pub mod charter;
pub mod metrics;

pub use alerts::{AlertSink, MeshAlert};
pub use charter::{CharterApi, CharterClient, PolicyHandle};
pub use metrics::{MetricsApi, MetricsClient, QueryResult};
