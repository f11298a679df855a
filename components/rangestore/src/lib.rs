// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Replicated command application for a range-partitioned key-value store.
//!
//! This crate turns committed consensus log entries of a single range into
//! durable state machine transitions on one replica. Entries are staged into
//! an application batch bound to a storage engine batch, checked by a
//! deterministic rejection predicate, combined with their declarative side
//! effects (splits, merges, membership changes, ingestions, log truncations),
//! and committed atomically together with the applied state key. Application
//! is the point at which consensus decisions become visible, so every
//! non-trivial failure here is fatal by design: there is no local recovery
//! path that could diverge from the other replicas.

#[macro_use]
mod errors;
pub mod store;

pub use crate::errors::{Error, Result};
