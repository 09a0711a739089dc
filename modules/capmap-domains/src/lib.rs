pub mod builder;
pub mod cmu;
pub mod components;
pub mod locations;
pub mod map;
pub mod query_helpers;
pub mod search;
pub mod subtypes;
pub mod summaries;

pub use components::{Component, ComponentFilter};
pub use locations::{
    Facets, LocationFilters, LocationGroup, LocationGroupSummary, Sort, SortKey, SortOrder,
    TextFilter, ViewportRow,
};
