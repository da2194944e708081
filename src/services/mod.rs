pub mod auth;
pub mod classifier;
pub mod jobs;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod submission;
pub mod sweeper;
pub mod temp_files;
pub mod worker;
