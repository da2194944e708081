//! Paleon Fossil Classification Service
//!
//! This library provides the asynchronous classification pipeline shared by the
//! API server and the worker binary: authenticated submission with per-tier
//! daily rate limits, a Redis-backed job queue, a PostgreSQL job store, and a
//! worker pool that calls an external vision-language model.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
