//! `jobagent-core`: the job-lifecycle engine shared by every agent host.
//! The claim loop, typed-slot accounting, child-process supervisor, timeout
//! enforcer, and retry duplicator.
//!
//! This crate knows nothing about Postgres, CLI wiring, or concrete
//! telemetry collection. Those are consumed through the [`repository`],
//! [`child`], and [`host`] trait seams respectively, and implemented by the
//! `jobagent-store-postgres` and `jobagent` (binary) crates.

pub mod child;
pub mod error;
pub mod host;
pub mod job;
pub mod lifecycle;
pub mod repository;
pub mod retry;
pub mod slots;
pub mod supervisor;
pub mod ticker;
