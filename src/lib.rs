//! Background reclamation of disk space.
//!
//! Each configured directory gets a [`jobs::reclaim::Reclaimer`] running on
//! its own [`worker::Worker`]. A reclaimer periodically scans its tree,
//! deletes the oldest files when the mount is over its limit, deletes files
//! past their retention timeout and prunes empty date-partitioned
//! directories. The [`controller::Controller`] owns the workers and shuts
//! them down together.

pub mod candidates;
pub mod cli;
pub mod config;
pub mod controller;
pub mod disk_info;
pub mod error;
pub mod job;
pub mod jobs;
pub mod utils;
pub mod worker;
