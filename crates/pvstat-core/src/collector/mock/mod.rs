//! Mock host fixtures for testing.
//!
//! Provides an in-memory [`MockFs`] and pre-built node scenarios so readers,
//! volume sources and the exporter can be tested without a real `/proc`,
//! `/dev` or kubelet directory.

mod filesystem;
pub mod scenarios;

pub use filesystem::MockFs;
