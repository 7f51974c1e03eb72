pub mod builder;
pub mod columns;
pub mod projection;

pub use builder::{
    build_distinct_query, build_get_query, build_list_query, build_read_back_query,
    build_update_query, classify_update, ListParams, ListQuery, PageLimits, SqlValue, Statement,
};
pub use projection::Projection;
