//! storecast — Core library for in-store audio broadcasting.
//!
//! Scheduled announcements are picked from a slot repository, played over
//! the background music through a playback device, and marked played.
//! The CLI consumes this crate; tests drive it with in-memory devices.

pub mod clock;
pub mod config;
pub mod controller;
pub mod crossfade;
pub mod device;
pub mod error;
pub mod freeze;
pub mod orchestrator;
pub mod repository;
pub mod rodio_device;
pub mod scheduler;
pub mod selector;
pub mod slot;
pub mod station;
