//! ETL pipeline and dimensional warehouse builder.
//!
//! Extracts records from heterogeneous sources, normalizes them into a
//! canonical staging shape, validates and cleanses them against configured
//! rules, conforms dimensions with slowly-changing-dimension semantics, and
//! loads facts idempotently into a star-schema warehouse. Every run is
//! audited as a load batch with a queryable data-quality report.

pub mod config;
pub mod connectors;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod warehouse;
