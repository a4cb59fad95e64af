//! AOI image alignment job orchestrator
//!
//! Accepts a pair of uploaded images and an area of interest, launches an
//! external alignment worker per job, records each job durably, and serves
//! a polling-friendly status API.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
