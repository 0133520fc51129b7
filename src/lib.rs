//! # Conformance tests for `EGL_ANDROID_native_fence_sync`
//!
//! The extension lets EGL sync objects wrap and export Linux `sync_file`
//! descriptors. This crate checks an EGL implementation against it, using
//! the kernel's `sw_sync` driver as a source of fences that are signaled
//! under the test's control.
//!
//! The building blocks are usable on their own:
//!
//! * [`SwSync`] creates software timelines and fences on them,
//! * [`SyncDriver`] is the set of EGL entry points under test, implemented
//!   for a real libEGL by `egl::EglDriver` and in-process by
//!   [`simulated::SimulatedDriver`],
//! * [`subtests::harness`] registers the checks themselves.
//!
//! ## Example
//!
//! ```rust,no_run
//! # extern crate native_fence_sync;
//! use native_fence_sync::{FenceStatus, SwSync};
//!
//! # fn main() -> native_fence_sync::Result<()> {
//! let sw_sync = SwSync::new();
//! if !sw_sync.is_supported() {
//!     return Ok(());
//! }
//!
//! let timeline = sw_sync.create_timeline()?;
//! let a = timeline.create_fence(1)?;
//! let b = timeline.create_fence(2)?;
//! let merged = a.merge(&b)?;
//! assert_eq!(merged.size()?, 2);
//!
//! timeline.advance(1)?;
//! assert_eq!(merged.count_status(FenceStatus::Signaled)?, 1);
//! # Ok(())
//! # }
//! ```
#![warn(missing_debug_implementations)]
#![deny(missing_docs)]

extern crate libc;
extern crate sw_sync_sys as ffi;

#[cfg(feature = "egl")]
extern crate khronos_egl;

#[macro_use]
extern crate bitflags;

mod backend;
mod driver;
mod error;
mod harness;
mod sw_sync;

#[cfg(feature = "egl")]
pub mod egl;
pub mod simulated;
pub mod subtests;
pub mod sync;

pub use self::backend::*;
pub use self::driver::*;
pub use self::error::*;
pub use self::harness::*;
pub use self::sw_sync::*;
pub use self::sync::{EglError, SyncStatus, SyncType};

/// Trait for types that allow to obtain the underlying raw handle.
pub trait AsRaw<T> {
    /// Receive the raw handle representing this type.
    fn as_raw(&self) -> T;
}

#[cfg(test)]
mod test {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}

    #[test]
    fn sw_sync_is_send() {
        is_send::<super::SwSync>();
        is_send::<super::Timeline>();
        is_send::<super::SyncFile>();
    }

    #[test]
    fn sw_sync_is_sync() {
        is_sync::<super::SwSync>();
        is_sync::<super::Timeline>();
        is_sync::<super::SyncFile>();
    }

    #[test]
    fn errors_are_send_and_sync() {
        is_send::<super::Error>();
        is_sync::<super::Error>();
    }
}
