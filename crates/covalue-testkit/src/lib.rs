//! # CoValue Testkit
//!
//! Testing utilities for CoValue nodes.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-memory networks of [`LocalNode`](covalue::LocalNode)s,
//!   a raw peer for speaking the wire protocol by hand, and an external
//!   signer for building (or tampering with) session batches
//! - **Generators**: Proptest strategies for concurrent map and list edits
//!
//! The scenario and property suites live in this crate's `tests/`.
//!
//! ## Test Networks
//!
//! ```rust,no_run
//! use covalue_testkit::fixtures::{TestNetwork, SETTLE};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let network = TestNetwork::mesh(3);
//!     let group = network.node(0).create_group()?;
//!     network.converged(&group, SETTLE).await
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalue_testkit::generators::map_ops;
//!
//! proptest! {
//!     #[test]
//!     fn edits_converge(ops in map_ops(3, 20)) {
//!         // apply each op on node op.node(), sync, compare content
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{converged, eventually, init_tracing, test_config, RawPeer, Signer, TestNetwork};
pub use generators::{list_ops, map_ops, ListOp, MapOp};
