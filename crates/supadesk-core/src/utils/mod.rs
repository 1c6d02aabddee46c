//! Utility functions for formatting and display.

pub mod format;

pub use format::{format_cell, format_expiry, truncate_string};
