// sqlstore - dialect-driven SQL generation and execution for feature stores
// Modular architecture: filters and dialects produce SQL, executors run it

// Clippy configuration - allow non-critical warnings
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::format_push_string)]
#![allow(clippy::wildcard_enum_match_arm)]
#![allow(clippy::inefficient_to_string)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::ref_option_ref)]
#![allow(clippy::clone_on_copy)]
#![allow(clippy::type_complexity)]
#![allow(clippy::module_name_repetitions)]

// Core value, schema, geometry and feature types
pub mod core;

// Filter model and rewriting passes (simplify, split, null guards)
pub mod filter;

// CQL-like filter and table definition parser
pub mod parser;

// Backend-specific SQL syntax, type mappings and capabilities
pub mod dialect;

// SQL generation (filter translation, statements, joins, virtual tables)
pub mod sql;

// Primary key model, resolution, caching and feature ids
pub mod primary_key;

// Driver seam (connections, statements, result sets) and the recording backend
pub mod backend;

// Transactions and feature locks
pub mod transaction;

// Query and mutation execution, the DataStore facade
pub mod executor;

// Store configuration (file + SQLSTORE_* environment)
pub mod config;

// Re-export commonly used types for convenience
pub use core::{AttributeDescriptor, DataType, Envelope, Feature, FeatureSchema, Geometry, StoreError, Value};
pub use filter::Filter;
pub use parser::parse_filter;
pub use dialect::{dialect_by_name, Dialect};
pub use sql::{AggregateRequest, AggregateValue, Join, Query, SortBy, VirtualTable};
pub use executor::{DataStore, FeatureEvent, FeatureEventSink, FeatureStream};
pub use transaction::{FeatureLock, Transaction};
pub use config::StoreConfig;
