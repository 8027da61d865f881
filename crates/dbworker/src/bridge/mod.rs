//! IPC bridge for dbworker parent-worker communication.
//!
//! This module provides the wire protocol and codec shared by the
//! connection (parent) and the executor running in the worker process.
//!
//! # Architecture
//!
//! - **protocol**: Request/Response value lists
//! - **codec**: length-prefixed framing over byte buffers

pub mod codec;
pub mod protocol;
