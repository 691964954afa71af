//! pmdedup Common - Shared types and utilities
//!
//! This crate provides the block and entry identifiers, the error type,
//! content fingerprints and the engine configuration used by every
//! pmdedup component.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use config::{DedupConfig, FinalizerConfig, ModeConfig};
pub use error::{Error, Result};
pub use fingerprint::{DefaultDigester, Digester, StrongFingerprint, WeakFingerprint};
pub use types::*;
