//! Scheduler library for tag-driven VM power management
//!
//! This crate provides the core functionality for:
//! - Resolving job settings from the environment
//! - Talking to the Azure Resource Manager compute API
//! - Deallocating and starting tagged VMs of a resource group
//! - Cron timers that fire the jobs
//! - Health checks and structured logging

pub mod compute;
pub mod health;
pub mod jobs;
pub mod models;
pub mod observability;
pub mod settings;
pub mod timer;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use jobs::PowerJob;
pub use models::*;
pub use observability::StructuredLogger;
pub use settings::{JobSettings, SettingsError};
pub use timer::{TimerSchedule, TimerTrigger};
