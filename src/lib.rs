pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod queue;
pub mod service;
pub mod store;
