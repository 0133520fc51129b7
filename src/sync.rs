//! EGL sync object vocabulary and lifecycle model
//!
//! Constants are the literal values from `EGL_KHR_fence_sync` and
//! `EGL_ANDROID_native_fence_sync`. [`SyncObject`] models the documented
//! behaviour of a sync object and is what the simulated driver hands out.

use std::os::unix::io::RawFd;

/// `EGLint`
pub type Int = i32;
/// `EGLenum`
pub type Enum = u32;

/// `eglGetError` value when no error is pending
pub const EGL_SUCCESS: Int = 0x3000;
/// Attribute list terminator
pub const EGL_NONE: Int = 0x3038;
/// A surface attribute, never valid for sync objects
pub const EGL_BUFFER_PRESERVED: Int = 0x3094;
/// Creation attribute of `EGL_KHR_cl_event2`, not valid for native fences
pub const EGL_CL_EVENT_HANDLE_KHR: Int = 0x309C;

/// Condition of a sync object created without a fence fd
pub const EGL_SYNC_PRIOR_COMMANDS_COMPLETE_KHR: Int = 0x30F0;
/// Status attribute key
pub const EGL_SYNC_STATUS_KHR: Int = 0x30F1;
/// Status value of a signaled sync object
pub const EGL_SIGNALED_KHR: Int = 0x30F2;
/// Status value of an unsignaled sync object
pub const EGL_UNSIGNALED_KHR: Int = 0x30F3;
/// Type attribute key
pub const EGL_SYNC_TYPE_KHR: Int = 0x30F7;
/// Condition attribute key
pub const EGL_SYNC_CONDITION_KHR: Int = 0x30F8;
/// Type tag of a plain fence sync
pub const EGL_SYNC_FENCE_KHR: Enum = 0x30F9;

/// Type tag of a native fence sync
pub const EGL_SYNC_NATIVE_FENCE_ANDROID: Enum = 0x3144;
/// Creation attribute carrying the fence descriptor
pub const EGL_SYNC_NATIVE_FENCE_FD_ANDROID: Int = 0x3145;
/// Condition of a sync object created from a fence fd
pub const EGL_SYNC_NATIVE_FENCE_SIGNALED_ANDROID: Int = 0x3146;
/// Placeholder descriptor meaning "no fence"
pub const EGL_NO_NATIVE_FENCE_FD_ANDROID: Int = -1;

/// Error codes reported by `eglGetError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum EglError {
    /// `EGL_NOT_INITIALIZED`
    #[error("EGL_NOT_INITIALIZED")]
    NotInitialized,
    /// `EGL_BAD_ACCESS`
    #[error("EGL_BAD_ACCESS")]
    BadAccess,
    /// `EGL_BAD_ALLOC`
    #[error("EGL_BAD_ALLOC")]
    BadAlloc,
    /// `EGL_BAD_ATTRIBUTE`
    #[error("EGL_BAD_ATTRIBUTE")]
    BadAttribute,
    /// `EGL_BAD_CONFIG`
    #[error("EGL_BAD_CONFIG")]
    BadConfig,
    /// `EGL_BAD_CONTEXT`
    #[error("EGL_BAD_CONTEXT")]
    BadContext,
    /// `EGL_BAD_CURRENT_SURFACE`
    #[error("EGL_BAD_CURRENT_SURFACE")]
    BadCurrentSurface,
    /// `EGL_BAD_DISPLAY`
    #[error("EGL_BAD_DISPLAY")]
    BadDisplay,
    /// `EGL_BAD_MATCH`
    #[error("EGL_BAD_MATCH")]
    BadMatch,
    /// `EGL_BAD_NATIVE_PIXMAP`
    #[error("EGL_BAD_NATIVE_PIXMAP")]
    BadNativePixmap,
    /// `EGL_BAD_NATIVE_WINDOW`
    #[error("EGL_BAD_NATIVE_WINDOW")]
    BadNativeWindow,
    /// `EGL_BAD_PARAMETER`
    #[error("EGL_BAD_PARAMETER")]
    BadParameter,
    /// `EGL_BAD_SURFACE`
    #[error("EGL_BAD_SURFACE")]
    BadSurface,
    /// `EGL_CONTEXT_LOST`
    #[error("EGL_CONTEXT_LOST")]
    ContextLost,
    /// A code outside the ones defined by EGL 1.5
    #[error("unknown EGL error 0x{0:x}")]
    Unknown(Int),
}

impl EglError {
    /// Decode an `eglGetError` value. `EGL_SUCCESS` decodes to `None`.
    pub fn from_code(code: Int) -> Option<EglError> {
        use self::EglError::*;
        Some(match code {
            EGL_SUCCESS => return None,
            0x3001 => NotInitialized,
            0x3002 => BadAccess,
            0x3003 => BadAlloc,
            0x3004 => BadAttribute,
            0x3005 => BadConfig,
            0x3006 => BadContext,
            0x3007 => BadCurrentSurface,
            0x3008 => BadDisplay,
            0x3009 => BadMatch,
            0x300A => BadNativePixmap,
            0x300B => BadNativeWindow,
            0x300C => BadParameter,
            0x300D => BadSurface,
            0x300E => ContextLost,
            other => Unknown(other),
        })
    }

    /// The raw EGL code
    pub fn code(self) -> Int {
        use self::EglError::*;
        match self {
            NotInitialized => 0x3001,
            BadAccess => 0x3002,
            BadAlloc => 0x3003,
            BadAttribute => 0x3004,
            BadConfig => 0x3005,
            BadContext => 0x3006,
            BadCurrentSurface => 0x3007,
            BadDisplay => 0x3008,
            BadMatch => 0x3009,
            BadNativePixmap => 0x300A,
            BadNativeWindow => 0x300B,
            BadParameter => 0x300C,
            BadSurface => 0x300D,
            ContextLost => 0x300E,
            Unknown(code) => code,
        }
    }
}

/// Kind of sync object passed to `eglCreateSyncKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// `EGL_SYNC_FENCE_KHR`
    Fence,
    /// `EGL_SYNC_NATIVE_FENCE_ANDROID`
    NativeFence,
}

impl SyncType {
    /// Decode a type tag, `None` for types this model does not support
    pub fn from_egl(ty: Enum) -> Option<SyncType> {
        match ty {
            EGL_SYNC_FENCE_KHR => Some(SyncType::Fence),
            EGL_SYNC_NATIVE_FENCE_ANDROID => Some(SyncType::NativeFence),
            _ => None,
        }
    }

    /// The value reported for `EGL_SYNC_TYPE_KHR`
    pub fn to_egl(self) -> Enum {
        match self {
            SyncType::Fence => EGL_SYNC_FENCE_KHR,
            SyncType::NativeFence => EGL_SYNC_NATIVE_FENCE_ANDROID,
        }
    }
}

/// Value of `EGL_SYNC_STATUS_KHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncStatus {
    /// `EGL_UNSIGNALED_KHR`
    Unsignaled,
    /// `EGL_SIGNALED_KHR`
    Signaled,
}

impl SyncStatus {
    /// Decode a queried status value
    pub fn from_egl(value: Int) -> Option<SyncStatus> {
        match value {
            EGL_UNSIGNALED_KHR => Some(SyncStatus::Unsignaled),
            EGL_SIGNALED_KHR => Some(SyncStatus::Signaled),
            _ => None,
        }
    }

    /// The raw EGL value
    pub fn to_egl(self) -> Int {
        match self {
            SyncStatus::Unsignaled => EGL_UNSIGNALED_KHR,
            SyncStatus::Signaled => EGL_SIGNALED_KHR,
        }
    }
}

/// Value of `EGL_SYNC_CONDITION_KHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCondition {
    /// Created without a fence fd, signals once prior GL commands complete
    PriorCommandsComplete,
    /// Created from a fence fd, signals with that fence
    NativeFenceSignaled,
}

impl SyncCondition {
    /// The raw EGL value
    pub fn to_egl(self) -> Int {
        match self {
            SyncCondition::PriorCommandsComplete => EGL_SYNC_PRIOR_COMMANDS_COMPLETE_KHR,
            SyncCondition::NativeFenceSignaled => EGL_SYNC_NATIVE_FENCE_SIGNALED_ANDROID,
        }
    }
}

/// Attributes accepted by `eglCreateSyncKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncAttribs {
    /// Fence descriptor the sync object takes ownership of
    pub native_fence_fd: Option<RawFd>,
}

impl SyncAttribs {
    /// Parse an `EGL_NONE` terminated attribute list.
    ///
    /// The end of the slice also terminates the list. Any key other than
    /// `EGL_SYNC_NATIVE_FENCE_FD_ANDROID` on a native fence, and any key at
    /// all on a plain fence, is `EGL_BAD_ATTRIBUTE`.
    pub fn parse(ty: SyncType, attribs: Option<&[Int]>) -> Result<SyncAttribs, EglError> {
        let mut parsed = SyncAttribs::default();
        let mut iter = attribs.unwrap_or(&[]).iter().copied();

        while let Some(key) = iter.next() {
            if key == EGL_NONE {
                break;
            }
            let value = iter.next().ok_or(EglError::BadAttribute)?;
            match (ty, key) {
                (SyncType::NativeFence, EGL_SYNC_NATIVE_FENCE_FD_ANDROID) => {
                    parsed.native_fence_fd = if value == EGL_NO_NATIVE_FENCE_FD_ANDROID {
                        None
                    } else {
                        Some(value)
                    };
                }
                _ => return Err(EglError::BadAttribute),
            }
        }

        Ok(parsed)
    }

    /// The condition a sync object created from these attributes reports
    pub fn condition(&self) -> SyncCondition {
        match self.native_fence_fd {
            Some(_) => SyncCondition::NativeFenceSignaled,
            None => SyncCondition::PriorCommandsComplete,
        }
    }
}

/// Lifecycle of a single sync object
///
/// Status only ever moves from unsignaled to signaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncObject {
    ty: SyncType,
    condition: SyncCondition,
    status: SyncStatus,
}

impl SyncObject {
    /// A freshly created, unsignaled sync object
    pub fn new(ty: SyncType, attribs: &SyncAttribs) -> SyncObject {
        SyncObject {
            ty,
            condition: attribs.condition(),
            status: SyncStatus::Unsignaled,
        }
    }

    /// Type of the sync object
    pub fn sync_type(&self) -> SyncType {
        self.ty
    }

    /// Condition of the sync object
    pub fn condition(&self) -> SyncCondition {
        self.condition
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Record whether the backing fence has signaled.
    ///
    /// Returns `true` if this call moved the object to signaled.
    pub fn observe(&mut self, signaled: bool) -> bool {
        if signaled && self.status == SyncStatus::Unsignaled {
            self.status = SyncStatus::Signaled;
            true
        } else {
            false
        }
    }

    /// Answer an `eglGetSyncAttribKHR` query
    pub fn attrib(&self, attribute: Int) -> Result<Int, EglError> {
        match attribute {
            EGL_SYNC_TYPE_KHR => Ok(self.ty.to_egl() as Int),
            EGL_SYNC_STATUS_KHR => Ok(self.status.to_egl()),
            EGL_SYNC_CONDITION_KHR => Ok(self.condition.to_egl()),
            _ => Err(EglError::BadAttribute),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_names() {
        assert_eq!(EglError::from_code(EGL_SUCCESS), None);
        assert_eq!(EglError::from_code(0x3009), Some(EglError::BadMatch));
        assert_eq!(EglError::BadAttribute.code(), 0x3004);
        assert_eq!(EglError::from_code(0x4242), Some(EglError::Unknown(0x4242)));
        assert_eq!(EglError::BadDisplay.to_string(), "EGL_BAD_DISPLAY");
        assert_eq!(EglError::Unknown(0x4242).to_string(), "unknown EGL error 0x4242");
    }

    #[test]
    fn empty_attrib_list_is_implicit() {
        for attribs in [None, Some(&[][..]), Some(&[EGL_NONE][..])] {
            let parsed = SyncAttribs::parse(SyncType::NativeFence, attribs).unwrap();
            assert_eq!(parsed.native_fence_fd, None);
            assert_eq!(parsed.condition(), SyncCondition::PriorCommandsComplete);
        }
    }

    #[test]
    fn fence_fd_attrib_is_explicit() {
        let list = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, 7, EGL_NONE];
        let parsed = SyncAttribs::parse(SyncType::NativeFence, Some(&list)).unwrap();
        assert_eq!(parsed.native_fence_fd, Some(7));
        assert_eq!(parsed.condition(), SyncCondition::NativeFenceSignaled);

        let list = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, EGL_NO_NATIVE_FENCE_FD_ANDROID, EGL_NONE];
        let parsed = SyncAttribs::parse(SyncType::NativeFence, Some(&list)).unwrap();
        assert_eq!(parsed.native_fence_fd, None);
    }

    #[test]
    fn unknown_attrib_is_rejected() {
        let list = [EGL_CL_EVENT_HANDLE_KHR, 0, EGL_NONE];
        assert_eq!(
            SyncAttribs::parse(SyncType::NativeFence, Some(&list)),
            Err(EglError::BadAttribute)
        );

        let list = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, 3, EGL_NONE];
        assert_eq!(
            SyncAttribs::parse(SyncType::Fence, Some(&list)),
            Err(EglError::BadAttribute)
        );

        let dangling = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID];
        assert_eq!(
            SyncAttribs::parse(SyncType::NativeFence, Some(&dangling)),
            Err(EglError::BadAttribute)
        );
    }

    #[test]
    fn status_never_reverts() {
        let attribs = SyncAttribs {
            native_fence_fd: Some(4),
        };
        let mut sync = SyncObject::new(SyncType::NativeFence, &attribs);
        assert_eq!(sync.status(), SyncStatus::Unsignaled);
        assert!(!sync.observe(false));
        assert!(sync.observe(true));
        assert!(!sync.observe(true));
        assert!(!sync.observe(false));
        assert_eq!(sync.status(), SyncStatus::Signaled);
    }

    #[test]
    fn query_reports_literal_values() {
        let sync = SyncObject::new(SyncType::NativeFence, &SyncAttribs::default());
        assert_eq!(
            sync.attrib(EGL_SYNC_TYPE_KHR),
            Ok(EGL_SYNC_NATIVE_FENCE_ANDROID as Int)
        );
        assert_eq!(sync.attrib(EGL_SYNC_STATUS_KHR), Ok(EGL_UNSIGNALED_KHR));
        assert_eq!(
            sync.attrib(EGL_SYNC_CONDITION_KHR),
            Ok(EGL_SYNC_PRIOR_COMMANDS_COMPLETE_KHR)
        );
        assert_eq!(sync.attrib(EGL_BUFFER_PRESERVED), Err(EglError::BadAttribute));
    }
}
