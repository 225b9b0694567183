pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod geo;
pub mod models;
pub mod notify;
pub mod observability;
pub mod routing;
pub mod state;
