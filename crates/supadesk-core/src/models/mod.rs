//! Data models for report queries and their results.
//!
//! Report rows are kept as JSON objects; the schema belongs to the database
//! and is not modelled here.

pub mod report;

pub use report::{Filter, FilterOp, Order, QueryError, Report, ReportQuery, Row};
