use crate::{AsRaw, Result};

use std::fmt;
use std::os::unix::io::RawFd;

/// Status of a single fence as reported by `SYNC_IOC_FILE_INFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not yet signaled
    Active,
    /// Signaled without error
    Signaled,
    /// Signaled with the given negative errno
    Error(i32),
}

impl FenceStatus {
    /// Decode the kernel's status field: `1` signaled, `0` active, negative errno otherwise
    pub fn from_raw(status: i32) -> FenceStatus {
        match status {
            0 => FenceStatus::Active,
            s if s > 0 => FenceStatus::Signaled,
            err => FenceStatus::Error(err),
        }
    }

    /// Encode in the kernel's representation
    pub fn as_raw(self) -> i32 {
        match self {
            FenceStatus::Active => 0,
            FenceStatus::Signaled => 1,
            FenceStatus::Error(err) => err,
        }
    }

    /// Whether the fence has completed, successfully or not
    pub fn is_signaled(self) -> bool {
        self != FenceStatus::Active
    }
}

/// An owned fence descriptor that can be handed to the EGL implementation
pub trait NativeFence: AsRaw<RawFd> + fmt::Debug + Sized {
    /// Duplicate the descriptor. Both copies refer to the same fence.
    fn try_clone(&self) -> Result<Self>;

    /// Give up ownership, returning the raw descriptor.
    ///
    /// The caller becomes responsible for closing it, usually by passing it
    /// to `eglCreateSyncKHR` or [`FenceBackend::destroy_descriptor`].
    fn into_raw(self) -> RawFd;
}

/// Source of deterministically signaled fences
///
/// The kernel implementation is [`SwSync`](crate::SwSync); tests on hosts
/// without `/dev/sw_sync` use [`SimulatedTimelines`](crate::simulated::SimulatedTimelines).
/// There is no wait operation: fences only signal when the
/// caller advances their timeline.
pub trait FenceBackend: fmt::Debug {
    /// Owned timeline handle, released on drop
    type Timeline: fmt::Debug;
    /// Owned fence handle, released on drop
    type Fence: NativeFence;

    /// Whether timelines can be created on this host. No side effects.
    fn is_supported(&self) -> bool;

    /// Create a new timeline with its counter at zero
    fn create_timeline(&self) -> Result<Self::Timeline>;

    /// Release a timeline. Unsignaled fences on it are signaled with an error.
    fn destroy_timeline(&self, timeline: Self::Timeline) {
        drop(timeline);
    }

    /// Create a fence that signals once `timeline` reaches `value`
    fn create_fence(&self, timeline: &Self::Timeline, value: u32) -> Result<Self::Fence>;

    /// Increment the counter of `timeline` by `delta`, signaling every fence
    /// whose value has been reached
    fn advance_timeline(&self, timeline: &Self::Timeline, delta: u32) -> Result<()>;

    /// Release a fence
    fn destroy_fence(&self, fence: Self::Fence) {
        drop(fence);
    }

    /// Create a fence that signals once both `a` and `b` have signaled
    fn merge_fences(&self, a: &Self::Fence, b: &Self::Fence) -> Result<Self::Fence>;

    /// Number of child fences in `fence`
    fn fence_size(&self, fence: &Self::Fence) -> Result<u32>;

    /// Number of child fences in `fence` currently in `status`
    fn fence_count_status(&self, fence: &Self::Fence, status: FenceStatus) -> Result<u32>;

    /// Number of child fences in `fence` that have signaled successfully
    fn fence_signal_count(&self, fence: &Self::Fence) -> Result<u32> {
        self.fence_count_status(fence, FenceStatus::Signaled)
    }

    /// Whether `fd` currently names an open descriptor
    fn descriptor_is_valid(&self, fd: RawFd) -> bool;

    /// Close a raw descriptor obtained through [`NativeFence::into_raw`].
    ///
    /// Invalid or already closed descriptors are ignored.
    fn destroy_descriptor(&self, fd: RawFd);
}

#[cfg(test)]
mod test {
    use super::FenceStatus;

    #[test]
    fn status_decoding_follows_kernel() {
        assert_eq!(FenceStatus::from_raw(0), FenceStatus::Active);
        assert_eq!(FenceStatus::from_raw(1), FenceStatus::Signaled);
        assert_eq!(FenceStatus::from_raw(-2), FenceStatus::Error(-2));
        assert!(!FenceStatus::Active.is_signaled());
        assert!(FenceStatus::Error(-2).is_signaled());
        assert_eq!(FenceStatus::Error(-2).as_raw(), -2);
    }
}
