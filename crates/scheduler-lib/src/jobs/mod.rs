//! Tag-driven power jobs
//!
//! A [`PowerJob`] resolves its settings, enumerates the VMs of the target
//! resource group and moves each eligible VM towards the job's target power
//! state, one VM at a time. Provider errors on a single VM are logged and
//! counted without stopping the batch; failures to enumerate fail the run.

mod runner;


pub use runner::{PowerJob, VmOutcome};
