pub mod api;
pub mod classification;
pub mod job;
pub mod rate_limit;
pub mod tier;
