//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - Fixed-size chunks uploaded independently, in any order, with retries
//! - Idempotent re-delivery of already stored chunks
//! - In-order reassembly, SHA-256 verification and hand-off to storage
//!
//! Protocol Flow:
//! 1. Client initiates with file name, size and checksum
//! 2. Server responds with the session id and chunk layout
//! 3. Client uploads chunks; status reports which are still missing
//! 4. Client completes; server merges, stores and announces the file

pub mod chunk_store;
pub mod reaper;
pub mod session;
pub mod store;
pub mod types;

pub use chunk_store::{compute_hash, sanitize_filename, ChunkStore, MergedFile};
pub use reaper::SessionReaper;
pub use session::{ReapReport, SessionManager, SessionSettings};
pub use store::{InMemorySessionStore, SessionStore};
pub use types::*;
