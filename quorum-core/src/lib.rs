pub mod crd;
pub mod error;
pub mod graph;
#[cfg(test)]
mod graph_test;
pub mod instances;
#[cfg(test)]
mod instances_test;

pub use error::OpsError;

/// Comma-separated list of canonical label selectors which match the
/// Quorum Operator's labelling scheme.
pub const QUORUM_OPERATOR_LABEL_SELECTORS: &str = "app=quorum,quorum.rs/controlled-by=quorum-operator";
