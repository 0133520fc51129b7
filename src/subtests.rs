//! The `EGL_ANDROID_native_fence_sync` conformance subtests
//!
//! Each subtest opens its own display and context through
//! [`TestContext`], so a failure in one never leaks into the next.

use crate::backend::{FenceBackend, FenceStatus, NativeFence};
use crate::driver::{SyncDriver, TestContext};
use crate::harness::{Harness, Subtest, TestResult};
use crate::sync::*;
use crate::{AsRaw, Result};

use std::fmt;

/// Sentinel stored in output variables before a query
pub const CANARY: Int = 0x3141_5926;

/// Everything a subtest runs against
pub struct Conformance<D, B> {
    /// The EGL implementation under test
    pub driver: D,
    /// Source of fences handed to the driver
    pub backend: B,
}

impl<D, B: fmt::Debug> fmt::Debug for Conformance<D, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conformance")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl<D, B> Conformance<D, B> {
    /// Pair a driver with the backend its fences come from
    pub fn new(driver: D, backend: B) -> Conformance<D, B> {
        Conformance { driver, backend }
    }
}

/// Every subtest, in the order they run by default
pub fn harness<D, B>() -> Harness<Conformance<D, B>>
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    Harness::new(vec![
        Subtest {
            name: "eglCreateSyncKHR_native_no_fence",
            option: "eglCreateSyncKHR_native_no_fence",
            run: native_no_fence,
        },
        Subtest {
            name: "eglCreateSyncKHR_native_from_fd",
            option: "eglCreateSyncKHR_native_from_fd",
            run: native_from_fd,
        },
        Subtest {
            name: "eglCreateSyncKHR_native_from_merged_fd",
            option: "eglCreateSyncKHR_native_from_merged_fd",
            run: native_from_merged_fd,
        },
        Subtest {
            name: "eglCreateSyncKHR_invalid_display",
            option: "eglCreateSyncKHR_invalid_display",
            run: invalid_display,
        },
        Subtest {
            name: "eglCreateSyncKHR_wrong_display",
            option: "eglCreateSyncKHR_wrong_display",
            run: wrong_display,
        },
        Subtest {
            name: "eglCreateSyncKHR_invalid_attrib_list",
            option: "eglCreateSyncKHR_invalid_attrib_list",
            run: invalid_attrib_list,
        },
        Subtest {
            name: "eglCreateSyncKHR_without_current_context",
            option: "eglCreateSyncKHR_without_current_context",
            run: without_current_context,
        },
        Subtest {
            name: "eglGetSyncAttribKHR_invalid_attrib",
            option: "eglGetSyncAttribKHR_invalid_attrib",
            run: get_sync_attrib_invalid_attrib,
        },
        Subtest {
            name: "eglDupNativeFenceFDANDROID",
            option: "eglDupNativeFenceFDANDROID",
            run: dup_native_fence_fd,
        },
        Subtest {
            name: "sw_sync_descriptor_lifecycle",
            option: "sw_sync_descriptor_lifecycle",
            run: descriptor_lifecycle,
        },
    ])
}

fn in_context<D, F>(driver: &mut D, body: F) -> TestResult
where
    D: SyncDriver,
    F: FnOnce(&mut TestContext<'_, D>) -> Option<D::Sync>,
{
    match TestContext::setup(driver) {
        Ok(mut ctx) => {
            let sync = body(&mut ctx);
            ctx.teardown(sync)
        }
        Err(result) => result,
    }
}

/// Unwrap a backend result, skipping when the host lacks sw_sync and failing otherwise
fn step<D: SyncDriver, T>(
    ctx: &mut TestContext<'_, D>,
    what: &str,
    result: Result<T>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_inconclusive() => {
            ctx.skip(format_args!("{}: {}", what, err));
            None
        }
        Err(err) => {
            ctx.fail(format_args!("{}: {}", what, err));
            None
        }
    }
}

fn expect_count<D: SyncDriver>(
    ctx: &mut TestContext<'_, D>,
    what: &str,
    result: Result<u32>,
    expected: u32,
) {
    if let Some(count) = step(ctx, what, result) {
        if count != expected {
            ctx.fail(format_args!("{} returned {} but expected {}", what, count, expected));
        }
    }
}

fn expect_status<D: SyncDriver>(ctx: &mut TestContext<'_, D>, sync: D::Sync, expected: SyncStatus) {
    let expected_name = match expected {
        SyncStatus::Signaled => "EGL_SIGNALED_KHR",
        SyncStatus::Unsignaled => "EGL_UNSIGNALED_KHR",
    };
    ctx.expect_attrib(
        sync,
        EGL_SYNC_STATUS_KHR,
        "EGL_SYNC_STATUS_KHR",
        expected.to_egl(),
        expected_name,
    );
}

fn expect_native_type<D: SyncDriver>(ctx: &mut TestContext<'_, D>, sync: D::Sync) {
    ctx.expect_attrib(
        sync,
        EGL_SYNC_TYPE_KHR,
        "EGL_SYNC_TYPE_KHR",
        EGL_SYNC_NATIVE_FENCE_ANDROID as Int,
        "EGL_SYNC_NATIVE_FENCE_ANDROID",
    );
}

/// Destroy a sync object that should never have been created
fn release_stray<D: SyncDriver>(ctx: &mut TestContext<'_, D>, display: D::Display, sync: D::Sync) {
    if let Err(err) = ctx.driver().destroy_sync(display, sync) {
        log::warn!("failed to destroy {:?} created in error: {}", sync, err);
    }
}

/// Create a native fence sync from a duplicate of `fence`.
///
/// The sync object owns the duplicate only if creation succeeds.
fn create_sync_from_fence<D, B>(
    ctx: &mut TestContext<'_, D>,
    backend: &B,
    fence: &B::Fence,
) -> Option<D::Sync>
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    let fd = step(ctx, "duplicating fence", fence.try_clone())?.into_raw();
    let attribs = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, fd, EGL_NONE];
    let sync = ctx.create_sync(
        EGL_SYNC_NATIVE_FENCE_ANDROID,
        Some(&attribs),
        "eglCreateSyncKHR(EGL_SYNC_NATIVE_FENCE_ANDROID, fd)",
    );
    if sync.is_none() {
        backend.destroy_descriptor(fd);
    }
    sync
}

fn native_no_fence<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let sync = ctx.create_sync(
            EGL_SYNC_NATIVE_FENCE_ANDROID,
            None,
            "eglCreateSyncKHR(EGL_SYNC_NATIVE_FENCE_ANDROID)",
        )?;

        expect_native_type(ctx, sync);
        if let Some(status) = ctx.query_attrib(sync, EGL_SYNC_STATUS_KHR, "EGL_SYNC_STATUS_KHR") {
            if SyncStatus::from_egl(status).is_none() {
                ctx.fail(format_args!(
                    "eglGetSyncAttribKHR(EGL_SYNC_STATUS_KHR) returned invalid status 0x{:x}",
                    status
                ));
            }
        }
        ctx.expect_attrib(
            sync,
            EGL_SYNC_CONDITION_KHR,
            "EGL_SYNC_CONDITION_KHR",
            EGL_SYNC_PRIOR_COMMANDS_COMPLETE_KHR,
            "EGL_SYNC_PRIOR_COMMANDS_COMPLETE_KHR",
        );

        Some(sync)
    })
}

fn native_from_fd<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    let Conformance { driver, backend } = env;
    if !backend.is_supported() {
        log::warn!("sw_sync is not supported on this host");
        return TestResult::Skip;
    }

    in_context(driver, |ctx| {
        let timeline = step(ctx, "creating timeline", backend.create_timeline())?;
        let fence = step(ctx, "creating fence", backend.create_fence(&timeline, 1))?;
        expect_count(ctx, "fence size", backend.fence_size(&fence), 1);
        expect_count(ctx, "signaled fences", backend.fence_signal_count(&fence), 0);

        let sync = create_sync_from_fence(ctx, backend, &fence)?;
        expect_native_type(ctx, sync);
        expect_status(ctx, sync, SyncStatus::Unsignaled);
        ctx.expect_attrib(
            sync,
            EGL_SYNC_CONDITION_KHR,
            "EGL_SYNC_CONDITION_KHR",
            EGL_SYNC_NATIVE_FENCE_SIGNALED_ANDROID,
            "EGL_SYNC_NATIVE_FENCE_SIGNALED_ANDROID",
        );

        if step(ctx, "advancing timeline", backend.advance_timeline(&timeline, 1)).is_some() {
            expect_count(ctx, "signaled fences", backend.fence_signal_count(&fence), 1);
            expect_status(ctx, sync, SyncStatus::Signaled);
        }

        Some(sync)
    })
}

fn native_from_merged_fd<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    let Conformance { driver, backend } = env;
    if !backend.is_supported() {
        log::warn!("sw_sync is not supported on this host");
        return TestResult::Skip;
    }

    in_context(driver, |ctx| {
        let first = step(ctx, "creating timeline", backend.create_timeline())?;
        let second = step(ctx, "creating timeline", backend.create_timeline())?;
        let a = step(ctx, "creating fence", backend.create_fence(&first, 1))?;
        let b = step(ctx, "creating fence", backend.create_fence(&second, 1))?;
        let merged = step(ctx, "merging fences", backend.merge_fences(&a, &b))?;
        expect_count(ctx, "merged fence size", backend.fence_size(&merged), 2);

        let sync = create_sync_from_fence(ctx, backend, &merged)?;
        expect_status(ctx, sync, SyncStatus::Unsignaled);

        if step(ctx, "advancing timeline", backend.advance_timeline(&first, 1)).is_some() {
            expect_count(ctx, "signaled fences", backend.fence_signal_count(&merged), 1);
            expect_status(ctx, sync, SyncStatus::Unsignaled);
        }
        if step(ctx, "advancing timeline", backend.advance_timeline(&second, 1)).is_some() {
            expect_count(ctx, "signaled fences", backend.fence_signal_count(&merged), 2);
            expect_status(ctx, sync, SyncStatus::Signaled);
        }

        Some(sync)
    })
}

fn invalid_display<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let display = ctx.driver().no_display();
        let result = ctx
            .driver()
            .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, None);
        let call = "eglCreateSyncKHR(EGL_NO_DISPLAY)";
        if let Some(sync) = ctx.expect_error(call, result, EglError::BadDisplay) {
            let display = ctx.display();
            release_stray(ctx, display, sync);
        }
        None
    })
}

fn wrong_display<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let current = ctx.display();
        let Some(other) = ctx.driver().open_second_display(current) else {
            ctx.skip(format_args!("no second EGLDisplay is available"));
            return None;
        };

        let result = ctx
            .driver()
            .create_sync(other, EGL_SYNC_NATIVE_FENCE_ANDROID, None);
        let call = "eglCreateSyncKHR(second display)";
        if let Some(sync) = ctx.expect_error(call, result, EglError::BadMatch) {
            release_stray(ctx, other, sync);
        }

        if let Err(err) = ctx.driver().terminate(other) {
            ctx.fail(format_args!("failed to terminate second EGLDisplay: {}", err));
        }
        None
    })
}

fn invalid_attrib_list<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let display = ctx.display();
        let attribs = [EGL_CL_EVENT_HANDLE_KHR, 0, EGL_NONE];
        let result = ctx
            .driver()
            .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, Some(&attribs));
        ctx.expect_error(
            "eglCreateSyncKHR(EGL_CL_EVENT_HANDLE_KHR)",
            result,
            EglError::BadAttribute,
        )
    })
}

fn without_current_context<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let display = ctx.display();
        if let Err(err) = ctx.driver().make_current(display, None) {
            ctx.fail(format_args!("failed to release the current context: {}", err));
            return None;
        }
        if let Some(context) = ctx.driver().current_context() {
            ctx.fail(format_args!("{:?} is still current after release", context));
            return None;
        }

        let result = ctx
            .driver()
            .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, None);
        ctx.expect_error("eglCreateSyncKHR without a current context", result, EglError::BadMatch)
    })
}

fn get_sync_attrib_invalid_attrib<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver,
{
    in_context(&mut env.driver, |ctx| {
        let sync = ctx.create_sync(
            EGL_SYNC_NATIVE_FENCE_ANDROID,
            None,
            "eglCreateSyncKHR(EGL_SYNC_NATIVE_FENCE_ANDROID)",
        )?;

        let display = ctx.display();
        let mut value = CANARY;
        let result = ctx
            .driver()
            .get_sync_attrib(display, sync, EGL_BUFFER_PRESERVED, &mut value);
        ctx.expect_error(
            "eglGetSyncAttribKHR(EGL_BUFFER_PRESERVED)",
            result,
            EglError::BadAttribute,
        );
        if value != CANARY {
            ctx.fail(format_args!(
                "eglGetSyncAttribKHR(EGL_BUFFER_PRESERVED) modified its output to 0x{:x}",
                value
            ));
        }

        Some(sync)
    })
}

fn dup_native_fence_fd<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    D: SyncDriver<Fence = B::Fence>,
    B: FenceBackend,
{
    let Conformance { driver, backend } = env;
    if !backend.is_supported() {
        log::warn!("sw_sync is not supported on this host");
        return TestResult::Skip;
    }

    in_context(driver, |ctx| {
        let timeline = step(ctx, "creating timeline", backend.create_timeline())?;
        let fence = step(ctx, "creating fence", backend.create_fence(&timeline, 1))?;
        let sync = create_sync_from_fence(ctx, backend, &fence)?;
        let display = ctx.display();

        match ctx.driver().dup_native_fence_fd(display, sync) {
            Ok(dup) => {
                ctx.check_no_error("eglDupNativeFenceFDANDROID");
                if !backend.descriptor_is_valid(dup.as_raw()) {
                    ctx.fail(format_args!(
                        "eglDupNativeFenceFDANDROID returned invalid descriptor {}",
                        dup.as_raw()
                    ));
                }
                expect_count(ctx, "duplicated fence size", backend.fence_size(&dup), 1);
                backend.destroy_fence(dup);
            }
            Err(err) => ctx.fail(format_args!("eglDupNativeFenceFDANDROID failed: {}", err)),
        }

        // Closing the duplicate must not disturb the sync object.
        expect_status(ctx, sync, SyncStatus::Unsignaled);
        if step(ctx, "advancing timeline", backend.advance_timeline(&timeline, 1)).is_some() {
            expect_status(ctx, sync, SyncStatus::Signaled);
        }

        match ctx.driver().dup_native_fence_fd(display, sync) {
            Ok(dup) => {
                expect_count(
                    ctx,
                    "duplicated fence signal count",
                    backend.fence_count_status(&dup, FenceStatus::Signaled),
                    1,
                );
            }
            Err(err) => ctx.fail(format_args!("second eglDupNativeFenceFDANDROID failed: {}", err)),
        }

        Some(sync)
    })
}

fn descriptor_lifecycle<D, B>(env: &mut Conformance<D, B>) -> TestResult
where
    B: FenceBackend,
{
    let backend = &env.backend;
    if !backend.is_supported() {
        log::warn!("sw_sync is not supported on this host");
        return TestResult::Skip;
    }

    let run = || -> Result<TestResult> {
        let mut result = TestResult::Pass;
        let first = backend.create_timeline()?;
        let second = backend.create_timeline()?;
        let orphan = backend.create_fence(&first, 1)?;
        let survivor = backend.create_fence(&second, 1)?;

        let raw = backend.create_fence(&second, 2)?.into_raw();
        backend.destroy_descriptor(raw);
        backend.destroy_descriptor(raw);
        if backend.descriptor_is_valid(raw) {
            log::error!("descriptor {} is still open after being destroyed", raw);
            result = TestResult::Fail;
        }

        backend.destroy_timeline(first);
        if !backend.descriptor_is_valid(orphan.as_raw()) {
            log::error!("destroying a timeline closed its fence");
            result = TestResult::Fail;
        }
        if !backend.descriptor_is_valid(survivor.as_raw()) {
            log::error!("destroying a timeline closed a fence of another timeline");
            result = TestResult::Fail;
        }

        backend.advance_timeline(&second, 1)?;
        if backend.fence_signal_count(&survivor)? != 1 {
            log::error!("fence did not signal after its timeline advanced");
            result = TestResult::Fail;
        }
        Ok(result)
    };

    run().unwrap_or_else(|err| {
        log::error!("{}", err);
        if err.is_inconclusive() {
            TestResult::Skip
        } else {
            TestResult::Fail
        }
    })
}
