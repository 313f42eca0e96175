//! Deterministic, pure logic shared by the review loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod action;
pub mod history;
pub mod lesson;
pub mod path;
pub mod policy;
pub mod scope;
pub mod session;
pub mod types;
