use crate::backend::NativeFence;
use crate::harness::TestResult;
use crate::sync::{EglError, Enum, Int};

use std::fmt;

/// The EGL entry points the conformance tests exercise
///
/// Implemented for a real libEGL by [`EglDriver`](crate::egl::EglDriver) and
/// in-process by [`SimulatedDriver`](crate::simulated::SimulatedDriver).
/// Every fallible call returns the error `eglGetError` reported for it, which
/// also clears it.
pub trait SyncDriver {
    /// `EGLDisplay`
    type Display: Copy + PartialEq + fmt::Debug;
    /// `EGLContext`
    type Context: Copy + PartialEq + fmt::Debug;
    /// `EGLSyncKHR`
    type Sync: Copy + PartialEq + fmt::Debug;
    /// Descriptor returned by `eglDupNativeFenceFDANDROID`
    type Fence: NativeFence;

    /// `EGL_NO_DISPLAY`
    fn no_display(&self) -> Self::Display;

    /// Get and initialize the default display and check it exposes
    /// `EGL_ANDROID_native_fence_sync`
    fn open_display(&mut self) -> Result<Self::Display, TestResult>;

    /// Another initialized display, distinct from `current`, if the platform
    /// can provide one
    fn open_second_display(&mut self, current: Self::Display) -> Option<Self::Display>;

    /// Create an OpenGL ES 2 context on `display` and make it current.
    ///
    /// Skips when the context cannot be made current without a surface or
    /// lacks `GL_OES_EGL_sync`.
    fn create_context(&mut self, display: Self::Display) -> Result<Self::Context, TestResult>;

    /// `eglMakeCurrent` without surfaces
    fn make_current(
        &mut self,
        display: Self::Display,
        context: Option<Self::Context>,
    ) -> Result<(), EglError>;

    /// `eglGetCurrentContext`
    fn current_context(&self) -> Option<Self::Context>;

    /// `glFinish` on the current context
    fn finish(&mut self);

    /// `eglDestroyContext`
    fn destroy_context(
        &mut self,
        display: Self::Display,
        context: Self::Context,
    ) -> Result<(), EglError>;

    /// `eglTerminate`
    fn terminate(&mut self, display: Self::Display) -> Result<(), EglError>;

    /// `eglGetError`, `None` for `EGL_SUCCESS`
    fn take_error(&mut self) -> Option<EglError>;

    /// `eglCreateSyncKHR`
    fn create_sync(
        &mut self,
        display: Self::Display,
        ty: Enum,
        attribs: Option<&[Int]>,
    ) -> Result<Self::Sync, EglError>;

    /// `eglDestroySyncKHR`
    fn destroy_sync(&mut self, display: Self::Display, sync: Self::Sync) -> Result<(), EglError>;

    /// `eglGetSyncAttribKHR`. `value` is only written on success.
    fn get_sync_attrib(
        &mut self,
        display: Self::Display,
        sync: Self::Sync,
        attribute: Int,
        value: &mut Int,
    ) -> Result<(), EglError>;

    /// `eglDupNativeFenceFDANDROID`
    fn dup_native_fence_fd(
        &mut self,
        display: Self::Display,
        sync: Self::Sync,
    ) -> Result<Self::Fence, EglError>;
}

/// Display and context owned by a single subtest
///
/// Created by [`TestContext::setup`] and released by
/// [`TestContext::teardown`], which also yields the subtest's result.
pub struct TestContext<'d, D: SyncDriver> {
    driver: &'d mut D,
    display: D::Display,
    context: D::Context,
    result: TestResult,
}

impl<'d, D: SyncDriver> fmt::Debug for TestContext<'d, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("display", &self.display)
            .field("context", &self.context)
            .field("result", &self.result)
            .finish()
    }
}

impl<'d, D: SyncDriver> TestContext<'d, D> {
    /// Open a display, create a context and make it current.
    ///
    /// On error everything acquired so far is released and the outcome the
    /// subtest should report is returned.
    pub fn setup(driver: &'d mut D) -> Result<TestContext<'d, D>, TestResult> {
        let display = driver.open_display()?;

        let context = match driver.create_context(display) {
            Ok(context) => context,
            Err(result) => {
                if let Err(err) = driver.terminate(display) {
                    log::error!("failed to terminate EGLDisplay: {}", err);
                    return Err(TestResult::Fail);
                }
                return Err(result);
            }
        };

        let mut ctx = TestContext {
            driver,
            display,
            context,
            result: TestResult::Pass,
        };
        if let Err(err) = ctx.driver.make_current(display, Some(context)) {
            log::error!("failed to make context current: {}", err);
            return Err(match ctx.teardown(None) {
                TestResult::Fail => TestResult::Fail,
                _ => TestResult::Skip,
            });
        }
        Ok(ctx)
    }

    /// The driver under test
    pub fn driver(&mut self) -> &mut D {
        &mut *self.driver
    }

    /// Display the context was created on
    pub fn display(&self) -> D::Display {
        self.display
    }

    /// The context made current by [`TestContext::setup`]
    pub fn context(&self) -> D::Context {
        self.context
    }

    /// Outcome so far
    pub fn result(&self) -> TestResult {
        self.result
    }

    /// Record a failed check
    pub fn fail(&mut self, args: fmt::Arguments<'_>) {
        log::error!("{}", args);
        self.result = TestResult::Fail;
    }

    /// Record that the subtest cannot run on this host, unless a check already failed
    pub fn skip(&mut self, args: fmt::Arguments<'_>) {
        log::warn!("{}", args);
        if self.result != TestResult::Fail {
            self.result = TestResult::Skip;
        }
    }

    /// Fail if the driver has an error pending after `call` succeeded
    pub fn check_no_error(&mut self, call: &str) {
        if let Some(err) = self.driver.take_error() {
            self.fail(format_args!("{} emitted an error: {}", call, err));
        }
    }

    /// Fail unless `result` is the error `expected`.
    ///
    /// Returns the value of an unexpected success so the caller can release it.
    pub fn expect_error<T>(
        &mut self,
        call: &str,
        result: Result<T, EglError>,
        expected: EglError,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                self.fail(format_args!("{} succeeded but was expected to emit {}", call, expected));
                Some(value)
            }
            Err(err) if err != expected => {
                self.fail(format_args!(
                    "{} emitted {} but was expected to emit {}",
                    call, err, expected
                ));
                None
            }
            Err(_) => None,
        }
    }

    /// `eglCreateSyncKHR` on this context's display, failing the subtest on error
    pub fn create_sync(
        &mut self,
        ty: Enum,
        attribs: Option<&[Int]>,
        call: &str,
    ) -> Option<D::Sync> {
        match self.driver.create_sync(self.display, ty, attribs) {
            Ok(sync) => {
                self.check_no_error(call);
                Some(sync)
            }
            Err(err) => {
                self.fail(format_args!("{} failed: {}", call, err));
                None
            }
        }
    }

    /// Query `attribute`, failing the subtest if the query fails or emits an error
    pub fn query_attrib(&mut self, sync: D::Sync, attribute: Int, name: &str) -> Option<Int> {
        let mut value = crate::subtests::CANARY;
        let call = format!("eglGetSyncAttribKHR({})", name);
        match self.driver.get_sync_attrib(self.display, sync, attribute, &mut value) {
            Ok(()) => {
                self.check_no_error(&call);
                Some(value)
            }
            Err(err) => {
                self.fail(format_args!("{} failed: {}", call, err));
                None
            }
        }
    }

    /// Query `attribute` and fail unless it equals `expected`
    pub fn expect_attrib(
        &mut self,
        sync: D::Sync,
        attribute: Int,
        name: &str,
        expected: Int,
        expected_name: &str,
    ) {
        if let Some(value) = self.query_attrib(sync, attribute, name) {
            if value != expected {
                self.fail(format_args!(
                    "eglGetSyncAttribKHR({}) returned 0x{:x} but expected {}(0x{:x})",
                    name, value, expected_name, expected
                ));
            }
        }
    }

    /// Release `sync`, the context and the display, returning the subtest's result
    pub fn teardown(mut self, sync: Option<D::Sync>) -> TestResult {
        if let Some(sync) = sync {
            match self.driver.destroy_sync(self.display, sync) {
                Ok(()) => self.check_no_error("eglDestroySyncKHR"),
                Err(err) => self.fail(format_args!("eglDestroySyncKHR failed: {}", err)),
            }
        }

        // Keep leftover GL commands from affecting the next subtest.
        if self.driver.current_context().is_some() {
            self.driver.finish();
        }

        if let Err(err) = self.driver.make_current(self.display, None) {
            self.fail(format_args!("failed to release the current context: {}", err));
        }
        if let Err(err) = self.driver.destroy_context(self.display, self.context) {
            self.fail(format_args!("failed to destroy EGLContext: {}", err));
        }
        if let Err(err) = self.driver.terminate(self.display) {
            self.fail(format_args!("failed to terminate EGLDisplay: {}", err));
        }

        self.result
    }
}
