//! # SQLFlow
//!
//! SQL-centric ELT engine: declarative pipelines over Apache DataFusion & Rust.
//!
//! ## Overview
//!
//! SQLFlow lets you:
//! - **Extract** data from databases, files, object stores and REST APIs
//! - **Transform** it with SQL (Apache DataFusion) using REPLACE / APPEND /
//!   UPSERT / INCREMENTAL write modes
//! - **Load** the results back into warehouses, files and object stores with
//!   an atomic stage-and-swap protocol
//!
//! ## Quick Start
//!
//! ```no_run
//! use sqlflow::cmd::Cli;
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cli = Cli::parse();
//!     std::process::exit(sqlflow::cmd::dispatch(cli).await);
//! }
//! ```
//!
//! ## Features
//!
//! - **Pipeline DSL**: SOURCE / LOAD / CREATE TABLE AS / EXPORT / SET /
//!   IF-ELSE / INCLUDE statements with `${var|default}` substitution
//! - **Execution planning**: statements are lowered into a dependency DAG
//!   and executed in a deterministic topological order
//! - **Incremental loading**: durable watermarks drive cursor-based reads
//!   and INCREMENTAL transforms with lookback
//! - **Connector resilience**: retry with exponential backoff, circuit
//!   breaking and token-bucket rate limiting around every external call
//! - **Structured Logging**: JSON and human-readable log formats
//!
//! ## Architecture
//!
//! ```text
//! Pipeline DSL → Planner (DAG) → Executor → DataFusion ↔ Connectors
//! ```
//!
//! - **Parser**: pipeline text into spanned statements
//! - **Planner**: statements into an operation DAG with resolved references
//! - **Executor**: walks the DAG, bridging connectors and the SQL engine
//! - **State**: watermark store backing all incremental operations

// Public API exports
pub use errors::{Result, SqlFlowError};

// Public modules
pub mod cmd;
pub mod condition;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod log;
pub mod parser;
pub mod pipeline;
pub mod planner;
pub mod resilience;
pub mod schema;
pub mod state;
pub mod utils;
pub mod vars;
