//! [`SyncDriver`] over the system libEGL
//!
//! `libEGL.so.1` is loaded at runtime through `khronos-egl`. The
//! `EGL_KHR_fence_sync` and `EGL_ANDROID_native_fence_sync` entry points, as
//! well as the two GL functions the tests need, are resolved with
//! `eglGetProcAddress`.

use crate::driver::SyncDriver;
use crate::harness::TestResult;
use crate::sync::{EglError, Enum, Int, EGL_NO_NATIVE_FENCE_FD_ANDROID, EGL_SUCCESS};
use crate::{Error, Result, SyncFile};

use khronos_egl as egl;

use std::ffi::c_void;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_char;
use std::os::unix::io::FromRawFd;
use std::ptr;

const EGL_OPENGL_ES3_BIT_KHR: Int = 0x0040;
const EGL_PLATFORM_SURFACELESS_MESA: Enum = 0x31DD;
const GL_EXTENSIONS: u32 = 0x1F03;

type CreateSyncFn = unsafe extern "system" fn(*mut c_void, Enum, *const Int) -> *mut c_void;
type DestroySyncFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> egl::Boolean;
type GetSyncAttribFn =
    unsafe extern "system" fn(*mut c_void, *mut c_void, Int, *mut Int) -> egl::Boolean;
type DupNativeFenceFdFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> Int;
type GetPlatformDisplayFn = unsafe extern "system" fn(Enum, *mut c_void, *const Int) -> *mut c_void;
type GetStringFn = unsafe extern "system" fn(u32) -> *const c_char;
type FinishFn = unsafe extern "system" fn();

macro_rules! proc_address {
    ($egl:expr, $name:literal) => {
        match $egl.get_proc_address($name) {
            // SAFETY: the symbol is the entry point named `$name`, whose
            // prototype is the declared function type.
            Some(addr) => unsafe { std::mem::transmute(addr) },
            None => {
                let missing = concat!($name, " is not available");
                return Err(Error::EglUnavailable(missing.to_owned()));
            }
        }
    };
}

/// `EGLSyncKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EglSync(*mut c_void);

/// The system EGL implementation
pub struct EglDriver {
    egl: egl::DynamicInstance<egl::EGL1_4>,
    create_sync: CreateSyncFn,
    destroy_sync: DestroySyncFn,
    get_sync_attrib: GetSyncAttribFn,
    dup_native_fence_fd: DupNativeFenceFdFn,
    get_platform_display: Option<GetPlatformDisplayFn>,
    get_string: GetStringFn,
    finish: FinishFn,
}

impl fmt::Debug for EglDriver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EglDriver")
            .field("version", &self.egl.version())
            .field("platform_display", &self.get_platform_display.is_some())
            .finish()
    }
}

fn convert(err: egl::Error) -> EglError {
    let code = err.native();
    EglError::from_code(code).unwrap_or(EglError::Unknown(code))
}

fn has_extension(extensions: &CStr, name: &str) -> bool {
    extensions
        .to_string_lossy()
        .split_whitespace()
        .any(|ext| ext == name)
}

impl EglDriver {
    /// Load libEGL and resolve the extension entry points.
    ///
    /// Fails with [`Error::EglUnavailable`] if the library or one of the
    /// required functions cannot be found.
    pub fn new() -> Result<EglDriver> {
        // SAFETY: libEGL has no initialization routine with preconditions.
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required() }
            .map_err(|err| Error::EglUnavailable(err.to_string()))?;

        let create_sync: CreateSyncFn = proc_address!(egl, "eglCreateSyncKHR");
        let destroy_sync: DestroySyncFn = proc_address!(egl, "eglDestroySyncKHR");
        let get_sync_attrib: GetSyncAttribFn = proc_address!(egl, "eglGetSyncAttribKHR");
        let dup_native_fence_fd: DupNativeFenceFdFn =
            proc_address!(egl, "eglDupNativeFenceFDANDROID");
        let get_string: GetStringFn = proc_address!(egl, "glGetString");
        let finish: FinishFn = proc_address!(egl, "glFinish");

        let get_platform_display = egl
            .get_proc_address("eglGetPlatformDisplayEXT")
            // SAFETY: see `proc_address!`
            .map(|addr| unsafe {
                std::mem::transmute::<extern "system" fn(), GetPlatformDisplayFn>(addr)
            });

        log::debug!("loaded EGL {:?}", egl.version());
        Ok(EglDriver {
            egl,
            create_sync,
            destroy_sync,
            get_sync_attrib,
            dup_native_fence_fd,
            get_platform_display,
            get_string,
            finish,
        })
    }

    /// The error of the failed call that just returned
    fn last_error(&self) -> EglError {
        self.egl
            .get_error()
            .map(convert)
            .unwrap_or(EglError::Unknown(EGL_SUCCESS))
    }

    fn display_has_extension(&self, display: egl::Display, name: &str) -> bool {
        self.egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|extensions| has_extension(extensions, name))
            .unwrap_or(false)
    }

    fn context_has_extension(&self, name: &str) -> bool {
        // SAFETY: a context is current and GL_EXTENSIONS is a valid name.
        let extensions = unsafe { (self.get_string)(GL_EXTENSIONS) };
        if extensions.is_null() {
            return false;
        }
        // SAFETY: glGetString returns a static NUL-terminated string.
        has_extension(unsafe { CStr::from_ptr(extensions) }, name)
    }

    fn release_context(&self, display: egl::Display, context: egl::Context) {
        if let Err(err) = self.egl.make_current(display, None, None, None) {
            log::error!("failed to release EGLContext: {}", err);
        }
        if let Err(err) = self.egl.destroy_context(display, context) {
            log::error!("failed to destroy EGLContext: {}", err);
        }
    }
}

impl SyncDriver for EglDriver {
    type Display = egl::Display;
    type Context = egl::Context;
    type Sync = EglSync;
    type Fence = SyncFile;

    fn no_display(&self) -> egl::Display {
        // SAFETY: EGL_NO_DISPLAY is a valid value for every display parameter.
        unsafe { egl::Display::from_ptr(egl::NO_DISPLAY) }
    }

    fn open_display(&mut self) -> Result<egl::Display, TestResult> {
        // SAFETY: EGL_DEFAULT_DISPLAY is always an accepted native display.
        let display = match unsafe { self.egl.get_display(egl::DEFAULT_DISPLAY) } {
            Some(display) => display,
            None => {
                log::warn!("no default EGLDisplay");
                return Err(TestResult::Skip);
            }
        };

        if let Err(err) = self.egl.initialize(display) {
            log::warn!("failed to initialize EGLDisplay: {}", err);
            return Err(TestResult::Skip);
        }

        if !self.display_has_extension(display, "EGL_ANDROID_native_fence_sync") {
            log::error!("display does not support EGL_ANDROID_native_fence_sync");
            if let Err(err) = self.egl.terminate(display) {
                log::error!("failed to terminate EGLDisplay: {}", err);
            }
            return Err(TestResult::Skip);
        }

        Ok(display)
    }

    fn open_second_display(&mut self, current: egl::Display) -> Option<egl::Display> {
        let get_platform_display = self.get_platform_display?;
        let client_extensions = self.egl.query_string(None, egl::EXTENSIONS).ok()?;
        if !has_extension(client_extensions, "EGL_MESA_platform_surfaceless") {
            return None;
        }

        // SAFETY: the surfaceless platform takes EGL_DEFAULT_DISPLAY and no attributes.
        let ptr = unsafe {
            get_platform_display(
                EGL_PLATFORM_SURFACELESS_MESA,
                egl::DEFAULT_DISPLAY,
                ptr::null(),
            )
        };
        if ptr.is_null() {
            log::debug!("eglGetPlatformDisplayEXT failed: {}", self.last_error());
            return None;
        }
        // SAFETY: non-null handle returned by eglGetPlatformDisplayEXT
        let display = unsafe { egl::Display::from_ptr(ptr) };
        if display == current {
            return None;
        }

        match self.egl.initialize(display) {
            Ok(_) => Some(display),
            Err(err) => {
                log::debug!("failed to initialize surfaceless EGLDisplay: {}", err);
                None
            }
        }
    }

    fn create_context(&mut self, display: egl::Display) -> Result<egl::Context, TestResult> {
        let config_attribs = [
            egl::RED_SIZE,
            egl::DONT_CARE,
            egl::GREEN_SIZE,
            egl::DONT_CARE,
            egl::BLUE_SIZE,
            egl::DONT_CARE,
            egl::ALPHA_SIZE,
            egl::DONT_CARE,
            egl::DEPTH_SIZE,
            egl::DONT_CARE,
            egl::STENCIL_SIZE,
            egl::DONT_CARE,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT | EGL_OPENGL_ES3_BIT_KHR,
            egl::NONE,
        ];
        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];

        let config = match self.egl.choose_first_config(display, &config_attribs) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::error!("no EGLConfig supports OpenGL ES 2");
                return Err(TestResult::Skip);
            }
            Err(err) => {
                log::error!("failed to get EGLConfig: {}", err);
                return Err(TestResult::Skip);
            }
        };

        if let Err(err) = self.egl.bind_api(egl::OPENGL_ES_API) {
            log::error!("failed to bind EGL_OPENGL_ES_API: {}", err);
            return Err(TestResult::Fail);
        }

        let context = match self.egl.create_context(display, config, None, &context_attribs) {
            Ok(context) => context,
            Err(err) => {
                log::error!("failed to create EGLContext: {}", err);
                return Err(TestResult::Fail);
            }
        };

        if let Err(err) = self.egl.make_current(display, None, None, Some(context)) {
            // Most likely no GL_OES_surfaceless_context or equivalent.
            log::error!("failed to make context current without surface: {}", err);
            self.release_context(display, context);
            return Err(TestResult::Skip);
        }

        if !self.context_has_extension("GL_OES_EGL_sync") {
            log::error!("context does not support GL_OES_EGL_sync; skipping test");
            self.release_context(display, context);
            return Err(TestResult::Skip);
        }

        Ok(context)
    }

    fn make_current(
        &mut self,
        display: egl::Display,
        context: Option<egl::Context>,
    ) -> Result<(), EglError> {
        self.egl
            .make_current(display, None, None, context)
            .map_err(convert)
    }

    fn current_context(&self) -> Option<egl::Context> {
        self.egl.get_current_context()
    }

    fn finish(&mut self) {
        // SAFETY: only called with a current context.
        unsafe { (self.finish)() }
    }

    fn destroy_context(
        &mut self,
        display: egl::Display,
        context: egl::Context,
    ) -> Result<(), EglError> {
        self.egl.destroy_context(display, context).map_err(convert)
    }

    fn terminate(&mut self, display: egl::Display) -> Result<(), EglError> {
        self.egl.terminate(display).map_err(convert)
    }

    fn take_error(&mut self) -> Option<EglError> {
        self.egl.get_error().map(convert)
    }

    /// `attribs` must end with `EGL_NONE`.
    fn create_sync(
        &mut self,
        display: egl::Display,
        ty: Enum,
        attribs: Option<&[Int]>,
    ) -> Result<EglSync, EglError> {
        let list = attribs.map_or(ptr::null(), <[Int]>::as_ptr);
        // SAFETY: `list` is null or a terminated attribute list outliving the call.
        let sync = unsafe { (self.create_sync)(display.as_ptr(), ty, list) };
        if sync.is_null() {
            return Err(self.last_error());
        }
        log::trace!("eglCreateSyncKHR(0x{:x}) = {:p}", ty, sync);
        Ok(EglSync(sync))
    }

    fn destroy_sync(&mut self, display: egl::Display, sync: EglSync) -> Result<(), EglError> {
        // SAFETY: EGL validates both handles.
        if unsafe { (self.destroy_sync)(display.as_ptr(), sync.0) } == egl::FALSE {
            return Err(self.last_error());
        }
        Ok(())
    }

    fn get_sync_attrib(
        &mut self,
        display: egl::Display,
        sync: EglSync,
        attribute: Int,
        value: &mut Int,
    ) -> Result<(), EglError> {
        // `value` goes to the driver untouched, so writes on failure stay observable.
        // SAFETY: `value` is a valid, exclusive pointer for the duration of the call.
        let ok = unsafe { (self.get_sync_attrib)(display.as_ptr(), sync.0, attribute, value) };
        if ok == egl::FALSE {
            return Err(self.last_error());
        }
        Ok(())
    }

    fn dup_native_fence_fd(
        &mut self,
        display: egl::Display,
        sync: EglSync,
    ) -> Result<SyncFile, EglError> {
        // SAFETY: EGL validates both handles.
        let fd = unsafe { (self.dup_native_fence_fd)(display.as_ptr(), sync.0) };
        if fd == EGL_NO_NATIVE_FENCE_FD_ANDROID {
            return Err(self.last_error());
        }
        // SAFETY: the returned descriptor is a new sync_file owned by the caller.
        Ok(unsafe { SyncFile::from_raw_fd(fd) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_lists_match_whole_names() {
        let list =
            CStr::from_bytes_with_nul(b"EGL_KHR_fence_sync EGL_ANDROID_native_fence_sync\0")
                .unwrap();
        assert!(has_extension(list, "EGL_ANDROID_native_fence_sync"));
        assert!(has_extension(list, "EGL_KHR_fence_sync"));
        assert!(!has_extension(list, "EGL_KHR_fence"));
        assert!(!has_extension(list, "EGL_ANDROID_native_fence_sync_extra"));
    }

    #[test]
    fn errors_convert_by_code() {
        assert_eq!(convert(egl::Error::BadMatch), EglError::BadMatch);
        assert_eq!(convert(egl::Error::ContextLost), EglError::ContextLost);
    }
}
