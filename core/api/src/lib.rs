//! Service client for FilenVault.
//!
//! This module provides:
//! - Explicit request/response structs for every endpoint used
//! - The [`FilenApi`] trait the transfer engine is written against
//! - A reqwest-backed implementation and an in-memory double for tests
//! - Client configuration
//!
//! # Design Principles
//! - Every response is validated on receipt; a missing field is a
//!   `Protocol` error naming the endpoint
//! - One trait call is one HTTP request; retry and re-login live above

pub mod config;
pub mod dto;
pub mod http;
pub mod memory;
pub mod service;

pub use config::ClientConfig;
pub use dto::{
    endpoints, raw_uuid, AuthInfo, ChunkTarget, CreateFolderRequest, DirContent, DoneRequest,
    FileInfo, LoginData, LoginRequest, MoveRequest, PrepareRequest, RemoteEntry, RemoteFolder,
    StorageUsage, UserInfo, AUTH_VERSION,
};
pub use http::HttpApi;
pub use memory::MemoryApi;
pub use service::{ByteStream, FilenApi};
