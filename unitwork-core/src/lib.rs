//! Core traits and engines for the unitwork crate.
//!
//! This crate provides the orchestration layer that sits between domain
//! aggregates and a transactional backend:
//!
//! - [`registry`] - Process-wide, name-keyed singleton registry
//! - [`diff`] - Immutable aggregate diff records and their builders
//! - [`trace`] - Structural diff engine driven by per-type descriptors
//! - [`aggregate`] - Aggregate, aggregate-root and entity primitives
//! - [`event`] - Domain events, capture metadata and the domain-event publisher
//! - [`bus`] - Topic-based in-process pub/sub with sync and async delivery
//! - [`context`] - Call context carrying cancellation, deadline, values and
//!   the transaction scope
//! - [`backend`] - Backend handle contracts plus an in-memory backend
//! - [`transaction`] - Transaction propagation manager
//! - [`repository`] - Unit-of-work hooks and the generic store-backed
//!   repository
//! - [`store`] - Physical row store contract and its in-memory implementation
//! - [`identity`] - Identity generation
//! - [`error`] - Tagged application errors and the unit-of-work error type
//!
//! # Example
//!
//! ```
//! use unitwork_core::{backend::inmemory, registry::Registry, transaction::TransactionManager};
//!
//! let registry = Registry::new();
//! let database = inmemory::Database::new();
//! let manager = TransactionManager::shared(&registry, database);
//! assert!(registry.contains(unitwork_core::transaction::TRANSACTION_MANAGER_NAME));
//! # drop(manager);
//! ```
//!
//! Most users should depend on the `unitwork` crate, which re-exports these
//! types together with the derive macros.

pub mod aggregate;
pub mod backend;
pub mod bus;
pub mod context;
pub mod diff;
pub mod error;
pub mod event;
pub mod identity;
pub mod registry;
pub mod repository;
pub mod store;
pub mod trace;
pub mod transaction;
