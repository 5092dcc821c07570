//! Knock Daemon Library
//!
//! Port-knocking authentication: clients prove knowledge of a shared secret
//! by sending UDP datagrams to a time-rotating, secret-derived sequence of
//! ports. This crate derives those sequences, tracks each source's progress
//! through them, and ingests knock datagrams from sockets or a capture
//! stream.

pub mod audit;
pub mod config;
pub mod error;
pub mod listen;
pub mod sequence;
pub mod tracker;
