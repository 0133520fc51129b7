//! In-process fence backend and EGL driver
//!
//! Lets the conformance subtests run deterministically on hosts without
//! `/dev/sw_sync` or a GPU, and documents the behaviour they expect from a
//! conforming implementation.
//!
//! ```rust
//! use native_fence_sync::simulated::{SimulatedDriver, SimulatedTimelines};
//! use native_fence_sync::subtests::{self, Conformance};
//! use native_fence_sync::TestResult;
//!
//! let fences = SimulatedTimelines::new();
//! let mut env = Conformance::new(SimulatedDriver::new(fences.clone()), fences);
//! let summary = subtests::harness()
//!     .run::<&str>(&mut env, &[], TestResult::Skip)
//!     .unwrap();
//! assert_eq!(summary.result, TestResult::Pass);
//! ```

mod driver;
mod timeline;

pub use self::driver::*;
pub use self::timeline::*;
