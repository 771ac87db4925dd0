// Module declarations
pub mod error;
pub mod value;
pub mod data_type;
pub mod geometry;
mod topology;
pub mod attribute;
pub mod schema;
pub mod feature;

// Re-exports for convenience
pub use error::{DriverError, StoreError};
pub use value::Value;
pub use data_type::{DataType, SqlType};
pub use geometry::{Coord, CoordinateTransform, Envelope, Geometry, GeometryKind, Shape};
pub use attribute::{AttributeDescriptor, EnumMapping};
pub use schema::FeatureSchema;
pub use feature::{Feature, JoinedFeature, StagedFeature};
