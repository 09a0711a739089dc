pub mod error;
pub mod geo;
pub mod registry;
pub mod technology;
pub mod types;
pub mod years;

pub use error::CapMapError;
pub use geo::{BoundingBox, UK_LAT_RANGE, UK_LON_RANGE};
pub use types::{CapacityConfidence, CmuIdSet};
