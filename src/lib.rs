//! # gatehouse: Session Control Plane
//!
//! Authoritative state service for automated work sessions: scoped credential
//! minting, per-credential rate limiting, redacted audit logging, a
//! deduplicating task registry, run history, readiness gates, and a presigned
//! artifact broker, served over HTTP by [`api`].

pub mod api;
pub mod artifacts;
pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gates;
pub mod prom_metrics;
pub mod rate_limit;
pub mod storage;
