//! In-process integration tests for the Beekeeper fabric.
//!
//! Every test wires real servers over the in-memory transport; only the
//! wire bytes are skipped.

mod harness;

mod execution;
mod fabric;
mod transfer;
