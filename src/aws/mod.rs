//! AWS plumbing: shared config contexts, cross-account credentials, error
//! classification, and the account/region iteration engine.

pub mod context;
pub mod credentials;
pub mod error;
pub mod iteration;
