//! cloudwarden - multi-account AWS governance
//!
//! This crate discovers resources across every account of an organization,
//! runs them through a validation chain that enforces tagging policy, and
//! processes CloudTrail events in near real time to catch resources as they
//! are created.

pub mod accounts;
pub mod aws;
pub mod checker;
pub mod cloudtrail;
pub mod config;
pub mod configurer;
pub mod metrics;
pub mod resource;
pub mod sink;
pub mod validator;
