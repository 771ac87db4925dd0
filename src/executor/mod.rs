/// Executor module - runs queries and mutations against a backend
///
/// Structure:
/// - connection: connection leases and session hooks
/// - mapper: row decoding and feature ids
/// - reader: streaming feature cursor
/// - post: in-memory filter/sort/paging layers
/// - queries: SELECT, COUNT, aggregate and bounds paths
/// - dml: INSERT/UPDATE/DELETE paths
/// - writer: update and buffered insert writers
/// - events: change notifications
/// - store: the `DataStore` facade tying them together

pub mod connection;
pub mod dml;
pub mod events;
pub mod mapper;
pub mod post;
pub mod queries;
pub mod reader;
pub mod store;
pub mod writer;

pub use connection::{expand_env, Connector, Lease, SessionHooks};
pub use dml::DmlExecutor;
pub use events::{EventBus, FeatureEvent, FeatureEventSink};
pub use mapper::{BranchMapper, ResultMapper};
pub use post::{FeatureIter, FeatureStream, PostProcessor};
pub use queries::QueryExecutor;
pub use reader::{FeatureReader, ReaderState};
pub use store::DataStore;
pub use writer::{InsertWriter, UpdateWriter};
