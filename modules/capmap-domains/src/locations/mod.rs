pub mod model;
pub mod store;

pub use model::{LocationGroup, LocationGroupSummary, ViewportRow};
pub use store::{Cursor, Facets, LocationFilters, Page, Sort, SortKey, SortOrder, TextFilter};
