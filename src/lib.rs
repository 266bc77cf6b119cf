//! Occupancy analytics for uploaded crowd footage: people are detected,
//! tracked and counted across the frame midline while a decaying grid
//! heatmap and the annotated stream are published to HTTP pollers.

pub mod analytics;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod heatmap;
pub mod job;
pub mod ledger;
pub mod persist;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod supervisor;
pub mod sync;
pub mod tracker;
pub mod video;
