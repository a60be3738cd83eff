//! Client recovery test harness.
//!
//! Drives two filesystem client mounts and the metadata service through failure scenarios
//! (client death, network partition, session eviction) and checks that session recovery
//! happens within the bounds the service is configured for.
//!
//! - [`mount`]: client mount lifecycle and background I/O holds
//! - [`session`]: typed view of the service's session and config admin commands
//! - [`service`]: the service lifecycle collaborator and its command-vector implementation
//! - [`scenario`]: the recovery scenarios and their shared fixture
//! - [`runner`]: sequencing, failure policy and the run report

/// Fails the surrounding scenario with [`HarnessError::Assertion`] unless `cond` holds.
macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::HarnessError::Assertion(format!($($arg)+)));
        }
    };
}

pub mod config;
pub mod error;
pub mod mount;
pub mod runner;
pub mod scenario;
pub mod service;
pub mod session;
pub mod timing;

pub use error::{HarnessError, Result};
