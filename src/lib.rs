//! Chunked Upload Server Library
//!
//! Resumable chunked file uploads: clients split a file into fixed-size
//! chunks, upload them independently and in any order, and the server
//! reassembles and verifies the file before handing it to storage.
//!
//! # Modules
//!
//! - `upload`: Session manager, chunk staging, session store and reaper
//! - `jobs`: Notification of completed files to the encoding pipeline
//! - `routes`: HTTP surface on axum

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod routes;
pub mod state;
pub mod upload;
