//! Gleaner DB - PostgreSQL persistence for users and their enrichment
//!
//! # Overview
//!
//! The main components are:
//! - [`EntityRepository`] - Users, addresses and credit cards with atomic upserts
//! - [`JobRepository`] - Persistent job queue for enrichment phases
//! - [`init_schema`] - Idempotent schema creation

mod job_repository;
mod repository;
mod schema;

pub use job_repository::JobRepository;
pub use repository::EntityRepository;
pub use schema::{SCHEMA, init_schema};
