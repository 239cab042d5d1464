//! Multi-instance routing layer:
//! - [`snapshot`]: sampled instance state and effective load
//! - [`score`]: normalized per-instance scorers
//! - [`policy`]: round-robin, least-loaded, weighted, adaptive-weighted
//! - [`affinity`]: router-side prefix cache index
//! - [`admission`]: edge admission control

pub mod admission;
pub mod affinity;
pub mod policy;
pub mod score;
pub mod snapshot;
