//! Session and key custody for FilenVault.
//!
//! This module provides:
//! - The master key vault that performs every wrap/unwrap under the
//!   account master key
//! - Authenticated sessions with login and one-shot re-login
//!
//! # Architecture
//! The vault sits between the service client and the transfer engine.
//! Transfers never see the master key itself, only wrapped key material.

pub mod master;
pub mod session;

pub use master::{unwrap_master_key, MasterKeyVault};
pub use session::{Session, SessionState};
