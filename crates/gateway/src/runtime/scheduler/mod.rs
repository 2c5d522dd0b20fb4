//! Periodic task scheduling: model, timezone-aware cron evaluation, the
//! task store, and the beat runner.

pub mod cron;
pub mod model;
pub mod runner;
pub mod store;
