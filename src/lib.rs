//! docwatch - directory watching and chunk ingestion for a vector store.
//!
//! This crate provides:
//! - A Master daemon that admits directories and supervises a fleet of
//!   Worker child processes
//! - Cross-process directory locking through on-disk lock files
//! - A per-file pipeline: scan, diff against the store, parse, chunk,
//!   embed, commit, with compensation on failure
//! - A JSON-RPC command surface over the Master's state

pub mod cancel;
pub mod chunking;
pub mod cli;
pub mod commands;
pub mod config;
pub mod facade;
pub mod lock;
pub mod master;
pub mod models;
pub mod parser;
pub mod retry;
pub mod scanner;
pub mod worker;
