//! Composition surface for the meshguard control plane
//!
//! Wires the upstream clients, the autonomic loop, and the federated
//! aggregator together and exposes the HTTP surface (health, prometheus
//! metrics, and the alert webhook sink).

pub mod controller;
pub mod handlers;
pub mod server;

pub use controller::Controller;
pub use server::Server;
