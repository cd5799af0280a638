//! Engine modules: pure translation of configuration into operation plans.
//!
//! The engine layer sits between configuration (what the caller wants) and
//! execution (which commands to run). It performs no I/O.

pub mod storage;
