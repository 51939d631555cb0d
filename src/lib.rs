//! querygate - query and admin HTTP gateway for a metrics store.
//!
//! The gateway serves the read, metadata and admin surface of the store in
//! the Prometheus v1 HTTP API shape. Storage, the query engine and the
//! discovery registries are collaborators behind traits; the crate ships a
//! SQLite store and a selector-only engine to run standalone.

pub mod admin;
pub mod config;
pub mod context;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod expr;
pub mod model;
pub mod notifications;
pub mod params;
pub mod rules;
pub mod storage;
pub mod web;
