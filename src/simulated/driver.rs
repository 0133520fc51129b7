use super::timeline::{SimFence, SimulatedTimelines};
use crate::driver::SyncDriver;
use crate::harness::TestResult;
use crate::sync::{EglError, Enum, Int, SyncAttribs, SyncCondition, SyncObject, SyncType};
use crate::backend::NativeFence;
use crate::AsRaw;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Display handle of a [`SimulatedDriver`], `SimDisplay(0)` is `EGL_NO_DISPLAY`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimDisplay(u32);

/// Context handle of a [`SimulatedDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimContext(u32);

/// Sync object handle of a [`SimulatedDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimSync(u32);

const NO_DISPLAY: SimDisplay = SimDisplay(0);
const DEFAULT_DISPLAY: SimDisplay = SimDisplay(1);
const SECOND_DISPLAY: SimDisplay = SimDisplay(2);

#[derive(Debug)]
struct SyncEntry {
    display: SimDisplay,
    object: SyncObject,
    /// Descriptor owned by the sync object: the one passed at creation, or
    /// the one minted when its commands were flushed
    fence: Option<RawFd>,
}

/// In-process EGL implementation of `EGL_ANDROID_native_fence_sync`
///
/// Follows the extension's documented behaviour, resolving fence descriptors
/// against a [`SimulatedTimelines`]. Implicit sync objects stand for pending
/// GL work and signal on [`SyncDriver::finish`].
#[derive(Debug)]
pub struct SimulatedDriver {
    fences: SimulatedTimelines,
    native_fence_sync: bool,
    second_display: bool,
    initialized: [bool; 2],
    contexts: HashMap<SimContext, SimDisplay>,
    current: Option<SimContext>,
    syncs: HashMap<SimSync, SyncEntry>,
    next_handle: u32,
}

impl SimulatedDriver {
    /// A driver resolving descriptors against `fences`
    pub fn new(fences: SimulatedTimelines) -> SimulatedDriver {
        SimulatedDriver {
            fences,
            native_fence_sync: true,
            second_display: true,
            initialized: [false; 2],
            contexts: HashMap::new(),
            current: None,
            syncs: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Do not advertise `EGL_ANDROID_native_fence_sync`
    pub fn without_native_fence_sync(mut self) -> SimulatedDriver {
        self.native_fence_sync = false;
        self
    }

    /// Only provide the default display
    pub fn without_second_display(mut self) -> SimulatedDriver {
        self.second_display = false;
        self
    }

    /// Number of sync objects not yet destroyed
    pub fn live_syncs(&self) -> usize {
        self.syncs.len()
    }

    fn slot(display: SimDisplay) -> Option<usize> {
        match display {
            DEFAULT_DISPLAY => Some(0),
            SECOND_DISPLAY => Some(1),
            _ => None,
        }
    }

    fn check_display(&self, display: SimDisplay) -> Result<(), EglError> {
        match Self::slot(display) {
            Some(slot) if self.initialized[slot] => Ok(()),
            _ => Err(EglError::BadDisplay),
        }
    }

    fn initialize(&mut self, display: SimDisplay) {
        if let Some(slot) = Self::slot(display) {
            self.initialized[slot] = true;
        }
    }

    fn handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn entry(&mut self, display: SimDisplay, sync: SimSync) -> Result<&mut SyncEntry, EglError> {
        self.check_display(display)?;
        match self.syncs.get_mut(&sync) {
            Some(entry) if entry.display == display => Ok(entry),
            _ => Err(EglError::BadParameter),
        }
    }

    fn release(&self, entry: SyncEntry) {
        if let Some(fd) = entry.fence {
            self.fences.close(fd);
        }
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        for (_, entry) in std::mem::take(&mut self.syncs) {
            self.release(entry);
        }
    }
}

impl SyncDriver for SimulatedDriver {
    type Display = SimDisplay;
    type Context = SimContext;
    type Sync = SimSync;
    type Fence = SimFence;

    fn no_display(&self) -> SimDisplay {
        NO_DISPLAY
    }

    fn open_display(&mut self) -> Result<SimDisplay, TestResult> {
        self.initialize(DEFAULT_DISPLAY);
        if !self.native_fence_sync {
            log::error!("display does not support EGL_ANDROID_native_fence_sync");
            if let Err(err) = self.terminate(DEFAULT_DISPLAY) {
                log::error!("failed to terminate EGLDisplay: {}", err);
            }
            return Err(TestResult::Skip);
        }
        Ok(DEFAULT_DISPLAY)
    }

    fn open_second_display(&mut self, current: SimDisplay) -> Option<SimDisplay> {
        if !self.second_display || current == SECOND_DISPLAY {
            return None;
        }
        self.initialize(SECOND_DISPLAY);
        Some(SECOND_DISPLAY)
    }

    fn create_context(&mut self, display: SimDisplay) -> Result<SimContext, TestResult> {
        if let Err(err) = self.check_display(display) {
            log::error!("failed to create EGLContext: {}", err);
            return Err(TestResult::Fail);
        }
        let context = SimContext(self.handle());
        self.contexts.insert(context, display);
        self.current = Some(context);
        Ok(context)
    }

    fn make_current(
        &mut self,
        display: SimDisplay,
        context: Option<SimContext>,
    ) -> Result<(), EglError> {
        self.check_display(display)?;
        match context {
            Some(context) => match self.contexts.get(&context) {
                Some(&owner) if owner == display => self.current = Some(context),
                Some(_) => return Err(EglError::BadMatch),
                None => return Err(EglError::BadContext),
            },
            None => self.current = None,
        }
        Ok(())
    }

    fn current_context(&self) -> Option<SimContext> {
        self.current
    }

    fn finish(&mut self) {
        for entry in self.syncs.values_mut() {
            if entry.object.condition() != SyncCondition::PriorCommandsComplete {
                continue;
            }
            entry.object.observe(true);
            if entry.object.sync_type() == SyncType::NativeFence && entry.fence.is_none() {
                entry.fence = Some(self.fences.signaled_fence().into_raw());
            }
        }
    }

    fn destroy_context(
        &mut self,
        display: SimDisplay,
        context: SimContext,
    ) -> Result<(), EglError> {
        self.check_display(display)?;
        match self.contexts.get(&context) {
            Some(&owner) if owner == display => {
                self.contexts.remove(&context);
                Ok(())
            }
            _ => Err(EglError::BadContext),
        }
    }

    fn terminate(&mut self, display: SimDisplay) -> Result<(), EglError> {
        let slot = Self::slot(display).ok_or(EglError::BadDisplay)?;
        self.initialized[slot] = false;

        let dead: Vec<SimSync> = self
            .syncs
            .iter()
            .filter(|(_, entry)| entry.display == display)
            .map(|(&sync, _)| sync)
            .collect();
        for sync in dead {
            if let Some(entry) = self.syncs.remove(&sync) {
                self.release(entry);
            }
        }

        let current = self.current;
        self.contexts
            .retain(|&context, &mut owner| owner != display || Some(context) == current);
        Ok(())
    }

    fn take_error(&mut self) -> Option<EglError> {
        None
    }

    fn create_sync(
        &mut self,
        display: SimDisplay,
        ty: Enum,
        attribs: Option<&[Int]>,
    ) -> Result<SimSync, EglError> {
        self.check_display(display)?;
        let ty = SyncType::from_egl(ty).ok_or(EglError::BadAttribute)?;
        let attribs = SyncAttribs::parse(ty, attribs)?;

        let current = self.current.ok_or(EglError::BadMatch)?;
        if self.contexts.get(&current) != Some(&display) {
            return Err(EglError::BadMatch);
        }

        let mut object = SyncObject::new(ty, &attribs);
        if let Some(fd) = attribs.native_fence_fd {
            let status = self.fences.status(fd).ok_or(EglError::BadParameter)?;
            object.observe(status.is_signaled());
        }

        let sync = SimSync(self.handle());
        log::trace!("created {:?} {:?} on {:?}", sync, object, display);
        self.syncs.insert(
            sync,
            SyncEntry {
                display,
                object,
                fence: attribs.native_fence_fd,
            },
        );
        Ok(sync)
    }

    fn destroy_sync(&mut self, display: SimDisplay, sync: SimSync) -> Result<(), EglError> {
        self.entry(display, sync)?;
        if let Some(entry) = self.syncs.remove(&sync) {
            self.release(entry);
        }
        Ok(())
    }

    fn get_sync_attrib(
        &mut self,
        display: SimDisplay,
        sync: SimSync,
        attribute: Int,
        value: &mut Int,
    ) -> Result<(), EglError> {
        let fences = self.fences.clone();
        let entry = self.entry(display, sync)?;
        if entry.object.condition() == SyncCondition::NativeFenceSignaled {
            if let Some(status) = entry.fence.and_then(|fd| fences.status(fd)) {
                entry.object.observe(status.is_signaled());
            }
        }
        *value = entry.object.attrib(attribute)?;
        Ok(())
    }

    fn dup_native_fence_fd(
        &mut self,
        display: SimDisplay,
        sync: SimSync,
    ) -> Result<SimFence, EglError> {
        let fences = self.fences.clone();
        let entry = self.entry(display, sync)?;
        if entry.object.sync_type() != SyncType::NativeFence {
            return Err(EglError::BadParameter);
        }
        // An implicit fence has no descriptor until its commands are flushed.
        let fd = entry.fence.ok_or(EglError::BadParameter)?;
        let dup = fences.dup(fd).ok_or(EglError::BadParameter)?;
        log::trace!("duplicated fence {} of {:?} as {}", fd, sync, dup.as_raw());
        Ok(dup)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::FenceBackend;
    use crate::subtests::CANARY;
    use crate::sync::*;

    fn current(fences: &SimulatedTimelines) -> (SimulatedDriver, SimDisplay) {
        let mut driver = SimulatedDriver::new(fences.clone());
        let display = driver.open_display().unwrap();
        driver.create_context(display).unwrap();
        (driver, display)
    }

    fn status(driver: &mut SimulatedDriver, display: SimDisplay, sync: SimSync) -> Int {
        let mut value = CANARY;
        driver
            .get_sync_attrib(display, sync, EGL_SYNC_STATUS_KHR, &mut value)
            .unwrap();
        value
    }

    #[test]
    fn merged_sync_waits_for_live_timeline() {
        let fences = SimulatedTimelines::new();
        let (mut driver, display) = current(&fences);
        let a = fences.create_timeline().unwrap();
        let b = fences.create_timeline().unwrap();
        let fa = fences.create_fence(&a, 1).unwrap();
        let fb = fences.create_fence(&b, 1).unwrap();
        let merged = fences.merge_fences(&fa, &fb).unwrap();

        let attribs = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, merged.into_raw(), EGL_NONE];
        let sync = driver
            .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, Some(&attribs))
            .unwrap();

        fences.destroy_timeline(a);
        assert_eq!(status(&mut driver, display, sync), EGL_UNSIGNALED_KHR);

        fences.advance_timeline(&b, 1).unwrap();
        assert_eq!(status(&mut driver, display, sync), EGL_SIGNALED_KHR);
    }

    #[test]
    fn terminated_display_is_bad_display() {
        let fences = SimulatedTimelines::new();
        let (mut driver, display) = current(&fences);
        driver.terminate(display).unwrap();
        assert_eq!(
            driver
                .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, None)
                .unwrap_err(),
            EglError::BadDisplay
        );
        assert_eq!(driver.live_syncs(), 0);
    }

    #[test]
    fn uninitialized_display_is_bad_display() {
        let fences = SimulatedTimelines::new();
        let (mut driver, _) = current(&fences);
        assert_eq!(
            driver
                .create_sync(SECOND_DISPLAY, EGL_SYNC_NATIVE_FENCE_ANDROID, None)
                .unwrap_err(),
            EglError::BadDisplay
        );
    }

    #[test]
    fn destroyed_sync_is_bad_parameter() {
        let fences = SimulatedTimelines::new();
        let (mut driver, display) = current(&fences);
        let sync = driver
            .create_sync(display, EGL_SYNC_NATIVE_FENCE_ANDROID, None)
            .unwrap();
        driver.destroy_sync(display, sync).unwrap();

        let mut value = CANARY;
        assert_eq!(
            driver
                .get_sync_attrib(display, sync, EGL_SYNC_STATUS_KHR, &mut value)
                .unwrap_err(),
            EglError::BadParameter
        );
        assert_eq!(value, CANARY);
        assert_eq!(
            driver.destroy_sync(display, sync).unwrap_err(),
            EglError::BadParameter
        );
    }

    #[test]
    fn unknown_sync_is_bad_parameter() {
        let fences = SimulatedTimelines::new();
        let (mut driver, display) = current(&fences);
        let unknown = SimSync(4242);

        let mut value = CANARY;
        assert_eq!(
            driver
                .get_sync_attrib(display, unknown, EGL_SYNC_TYPE_KHR, &mut value)
                .unwrap_err(),
            EglError::BadParameter
        );
        assert_eq!(value, CANARY);
        assert_eq!(
            driver.destroy_sync(display, unknown).unwrap_err(),
            EglError::BadParameter
        );
        assert_eq!(
            driver.dup_native_fence_fd(display, unknown).unwrap_err(),
            EglError::BadParameter
        );
    }
}
