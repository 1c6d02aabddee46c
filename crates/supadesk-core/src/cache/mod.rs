//! Local caching module for offline report viewing.
//!
//! This module provides the `ReportCache` for storing and retrieving report
//! results locally. Reports are cached in JSON format, keyed by query, and
//! considered stale after 60 minutes unless configured otherwise.

pub mod manager;

pub use manager::{CachedData, ReportCache, DEFAULT_STALE_MINUTES};
