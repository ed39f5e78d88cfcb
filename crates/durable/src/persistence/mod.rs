//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobStore`] trait for job and configuration persistence
//! - [`SqliteJobStore`] shared by every worker process on a host
//! - [`InMemoryJobStore`] for testing

mod memory;
mod sqlite;
mod store;
pub(crate) mod time;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, StateCounts, StoreError};
