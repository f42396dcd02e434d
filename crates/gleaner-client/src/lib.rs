//! Gleaner Client - HTTP record sources
//!
//! This crate provides the remote side of the enrichment pipeline:
//!
//! - [`http`] - A record source for one read-only JSON endpoint
//! - [`factory`] - Maps each phase to its configured endpoint
//!
//! # Overview
//!
//! Sources fetch one page of loosely-typed items and classify failures as
//! transient or fatal. Normalization and retrying happen in `gleaner-core`.

pub mod factory;
pub mod http;

pub use factory::HttpSourceFactory;
pub use http::HttpSource;
