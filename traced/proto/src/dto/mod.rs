pub mod diff;
pub mod live;
pub mod query;
