//! Utility modules for SQLFlow.
//!
//! This module contains helper utilities for Arrow data handling shared by
//! the mode executors and connectors.

pub mod arrow_ext;
