//! Siteforge core
//!
//! This crate drives AI-assisted generation and modification of small
//! web-application projects. One request flows through a multi-stage
//! pipeline: resolve project identity, materialize a workspace,
//! stream a generation, parse the output into files, package the
//! workspace, trigger a remote build, deploy, and persist history.
//!
//! # Features
//! - Session cache service (shared, TTL-expired, replica-safe)
//! - Project identity resolution with duplicate short-circuit
//! - Bounded conversation context assembly
//! - Streaming pipeline orchestration with guaranteed cleanup
//! - MongoDB persistence with an in-memory twin for dev and tests

pub mod cache;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod output_parser;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod workspace;

pub use db::MongoDb;
pub use error::{ForgeError, ForgeResult};
