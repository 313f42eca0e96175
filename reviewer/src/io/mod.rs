//! Side-effecting adapters used by the review loop.

pub mod build;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod editor;
pub mod git;
pub mod index;
pub mod journal;
pub mod layout;
pub mod process;
pub mod prompt;
pub mod transcript;
