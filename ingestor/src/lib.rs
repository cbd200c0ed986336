//! Ingestion and time-series storage core for ESP32 temperature/humidity
//! sensors.
//!
//! Write path: [`validate`] -> [`dedup`] -> [`db`]. Read path: [`db`] range
//! scans feeding [`aggregate`]. [`retention`] prunes on its own schedule.
//! [`service::TelemetryService`] composes them into the operations exposed
//! by the [`rest`] and [`mqtt`] transports.

pub mod aggregate;
pub mod batching;
pub mod config;
pub mod db;
pub mod dedup;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod retention;
pub mod service;
pub mod validate;
