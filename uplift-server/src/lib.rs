//! # Uplift Server
//!
//! HTTP surface of the upload pipeline:
//!
//! - `POST /generate-presigned-url` and `POST /upload`, the ingestion API
//! - `PUT`/`GET /objects/{key}`, where issued locations point
//! - `GET /ops/*`, operator views of backlog, dead letters and grants
//!
//! The binary wires these routes to the in-memory pipeline and runs the
//! pipeline runtime alongside the HTTP server.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;
