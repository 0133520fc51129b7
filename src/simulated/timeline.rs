use crate::backend::{FenceBackend, FenceStatus, NativeFence};
use crate::{AsRaw, Error, Result};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Descriptors handed out by the simulation start here, far away from
/// anything a real process would have open.
const FIRST_DESCRIPTOR: RawFd = 1 << 20;

/// Dead timeline backing every fence minted by `signaled_fence`
const SIGNALED_TIMELINE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FencePoint {
    timeline: u32,
    value: u32,
}

#[derive(Debug)]
struct TimelineState {
    value: u32,
    alive: bool,
}

#[derive(Debug)]
struct Registry {
    timelines: HashMap<u32, TimelineState>,
    descriptors: HashMap<RawFd, Vec<FencePoint>>,
    next_timeline: u32,
    next_descriptor: RawFd,
}

impl Registry {
    fn point_status(&self, point: &FencePoint) -> FenceStatus {
        match self.timelines.get(&point.timeline) {
            Some(timeline) if timeline.value >= point.value => FenceStatus::Signaled,
            Some(timeline) if timeline.alive => FenceStatus::Active,
            _ => FenceStatus::Error(-libc::ENOENT),
        }
    }

    fn insert(&mut self, points: Vec<FencePoint>) -> RawFd {
        let fd = self.next_descriptor;
        self.next_descriptor += 1;
        self.descriptors.insert(fd, points);
        fd
    }

    fn points(&self, fd: RawFd) -> Result<&[FencePoint]> {
        self.descriptors
            .get(&fd)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::OperationFailed {
                operation: "SYNC_IOC_FILE_INFO",
                source: io::Error::from_raw_os_error(libc::EBADF),
            })
    }
}

/// In-process stand-in for the kernel's sw_sync timelines
///
/// Cloning yields another handle to the same set of timelines and fences, so
/// a [`SimulatedDriver`](super::SimulatedDriver) can resolve descriptors
/// minted here.
#[derive(Clone)]
pub struct SimulatedTimelines {
    registry: Rc<RefCell<Registry>>,
}

impl fmt::Debug for SimulatedTimelines {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("SimulatedTimelines")
            .field("timelines", &registry.timelines.len())
            .field("descriptors", &registry.descriptors.len())
            .finish()
    }
}

impl Default for SimulatedTimelines {
    fn default() -> Self {
        SimulatedTimelines::new()
    }
}

impl SimulatedTimelines {
    /// An empty simulation
    pub fn new() -> SimulatedTimelines {
        let mut timelines = HashMap::new();
        timelines.insert(
            SIGNALED_TIMELINE,
            TimelineState {
                value: 1,
                alive: false,
            },
        );
        SimulatedTimelines {
            registry: Rc::new(RefCell::new(Registry {
                timelines,
                descriptors: HashMap::new(),
                next_timeline: SIGNALED_TIMELINE + 1,
                next_descriptor: FIRST_DESCRIPTOR,
            })),
        }
    }

    /// Number of descriptors currently open
    pub fn open_descriptors(&self) -> usize {
        self.registry.borrow().descriptors.len()
    }

    /// Combined status of the fences behind `fd`, `None` if `fd` is not open.
    ///
    /// The fence is active until every child has signaled. Once they all
    /// have, the first child error is reported.
    pub(crate) fn status(&self, fd: RawFd) -> Option<FenceStatus> {
        let registry = self.registry.borrow();
        let points = registry.descriptors.get(&fd)?;
        let mut error = None;
        for point in points {
            match registry.point_status(point) {
                FenceStatus::Active => return Some(FenceStatus::Active),
                FenceStatus::Error(err) => {
                    error.get_or_insert(err);
                }
                FenceStatus::Signaled => {}
            }
        }
        Some(error.map_or(FenceStatus::Signaled, FenceStatus::Error))
    }

    /// Open another descriptor for the fences behind `fd`
    pub(crate) fn dup(&self, fd: RawFd) -> Option<SimFence> {
        let mut registry = self.registry.borrow_mut();
        let points = registry.descriptors.get(&fd)?.clone();
        let fd = registry.insert(points);
        Some(self.wrap(fd))
    }

    /// Mint a descriptor for a fence that has already signaled
    pub(crate) fn signaled_fence(&self) -> SimFence {
        let fd = self.registry.borrow_mut().insert(vec![FencePoint {
            timeline: SIGNALED_TIMELINE,
            value: 1,
        }]);
        self.wrap(fd)
    }

    pub(crate) fn close(&self, fd: RawFd) -> bool {
        self.registry.borrow_mut().descriptors.remove(&fd).is_some()
    }

    fn wrap(&self, fd: RawFd) -> SimFence {
        SimFence {
            fd,
            registry: self.clone(),
            released: false,
        }
    }
}

/// A timeline of a [`SimulatedTimelines`]
pub struct SimTimeline {
    id: u32,
    registry: SimulatedTimelines,
}

impl fmt::Debug for SimTimeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimTimeline").field("id", &self.id).finish()
    }
}

impl Drop for SimTimeline {
    fn drop(&mut self) {
        if let Some(timeline) = self.registry.registry.borrow_mut().timelines.get_mut(&self.id) {
            timeline.alive = false;
        }
    }
}

/// A fence descriptor of a [`SimulatedTimelines`]
pub struct SimFence {
    fd: RawFd,
    registry: SimulatedTimelines,
    released: bool,
}

impl fmt::Debug for SimFence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimFence").field("fd", &self.fd).finish()
    }
}

impl AsRaw<RawFd> for SimFence {
    fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SimFence {
    fn drop(&mut self) {
        if !self.released {
            self.registry.close(self.fd);
        }
    }
}

impl NativeFence for SimFence {
    fn try_clone(&self) -> Result<SimFence> {
        self.registry
            .dup(self.fd)
            .ok_or_else(|| Error::OperationFailed {
                operation: "dup",
                source: io::Error::from_raw_os_error(libc::EBADF),
            })
    }

    fn into_raw(mut self) -> RawFd {
        self.released = true;
        self.fd
    }
}

impl FenceBackend for SimulatedTimelines {
    type Timeline = SimTimeline;
    type Fence = SimFence;

    fn is_supported(&self) -> bool {
        true
    }

    fn create_timeline(&self) -> Result<SimTimeline> {
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_timeline;
        registry.next_timeline += 1;
        registry
            .timelines
            .insert(id, TimelineState { value: 0, alive: true });
        Ok(SimTimeline {
            id,
            registry: self.clone(),
        })
    }

    fn create_fence(&self, timeline: &SimTimeline, value: u32) -> Result<SimFence> {
        let fd = self.registry.borrow_mut().insert(vec![FencePoint {
            timeline: timeline.id,
            value,
        }]);
        Ok(self.wrap(fd))
    }

    fn advance_timeline(&self, timeline: &SimTimeline, delta: u32) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let state = registry
            .timelines
            .get_mut(&timeline.id)
            .ok_or_else(|| Error::OperationFailed {
                operation: "SW_SYNC_IOC_INC",
                source: io::Error::from_raw_os_error(libc::EBADF),
            })?;
        state.value = state.value.saturating_add(delta);
        Ok(())
    }

    fn merge_fences(&self, a: &SimFence, b: &SimFence) -> Result<SimFence> {
        let mut registry = self.registry.borrow_mut();
        let mut points = registry.points(a.fd)?.to_vec();
        for point in registry.points(b.fd)? {
            if !points.contains(point) {
                points.push(*point);
            }
        }
        let fd = registry.insert(points);
        drop(registry);
        Ok(self.wrap(fd))
    }

    fn fence_size(&self, fence: &SimFence) -> Result<u32> {
        Ok(self.registry.borrow().points(fence.fd)?.len() as u32)
    }

    fn fence_count_status(&self, fence: &SimFence, status: FenceStatus) -> Result<u32> {
        let registry = self.registry.borrow();
        Ok(registry
            .points(fence.fd)?
            .iter()
            .filter(|point| registry.point_status(point) == status)
            .count() as u32)
    }

    fn descriptor_is_valid(&self, fd: RawFd) -> bool {
        self.registry.borrow().descriptors.contains_key(&fd)
    }

    fn destroy_descriptor(&self, fd: RawFd) {
        self.close(fd);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fence_signals_once_value_is_reached() {
        let sim = SimulatedTimelines::new();
        let timeline = sim.create_timeline().unwrap();
        let fence = sim.create_fence(&timeline, 2).unwrap();

        assert_eq!(sim.fence_size(&fence).unwrap(), 1);
        assert_eq!(sim.fence_signal_count(&fence).unwrap(), 0);
        sim.advance_timeline(&timeline, 1).unwrap();
        assert_eq!(sim.status(fence.as_raw()), Some(FenceStatus::Active));
        sim.advance_timeline(&timeline, 1).unwrap();
        assert_eq!(sim.fence_signal_count(&fence).unwrap(), 1);
        assert_eq!(sim.status(fence.as_raw()), Some(FenceStatus::Signaled));
    }

    #[test]
    fn destroyed_timeline_errors_pending_fences() {
        let sim = SimulatedTimelines::new();
        let timeline = sim.create_timeline().unwrap();
        let done = sim.create_fence(&timeline, 1).unwrap();
        let pending = sim.create_fence(&timeline, 5).unwrap();
        sim.advance_timeline(&timeline, 1).unwrap();
        sim.destroy_timeline(timeline);

        assert_eq!(sim.status(done.as_raw()), Some(FenceStatus::Signaled));
        assert_eq!(
            sim.status(pending.as_raw()),
            Some(FenceStatus::Error(-libc::ENOENT))
        );
        assert_eq!(
            sim.fence_count_status(&pending, FenceStatus::Error(-libc::ENOENT))
                .unwrap(),
            1
        );
    }

    #[test]
    fn merged_fence_waits_for_every_child() {
        let sim = SimulatedTimelines::new();
        let a = sim.create_timeline().unwrap();
        let b = sim.create_timeline().unwrap();
        let fa = sim.create_fence(&a, 1).unwrap();
        let fb = sim.create_fence(&b, 1).unwrap();
        let merged = sim.merge_fences(&fa, &fb).unwrap();

        assert_eq!(sim.fence_size(&merged).unwrap(), 2);
        sim.advance_timeline(&a, 1).unwrap();
        assert_eq!(sim.fence_signal_count(&merged).unwrap(), 1);
        assert_eq!(sim.status(merged.as_raw()), Some(FenceStatus::Active));
        sim.advance_timeline(&b, 1).unwrap();
        assert_eq!(sim.status(merged.as_raw()), Some(FenceStatus::Signaled));
    }

    #[test]
    fn merge_stays_active_while_a_child_is_pending() {
        let sim = SimulatedTimelines::new();
        let a = sim.create_timeline().unwrap();
        let b = sim.create_timeline().unwrap();
        let fa = sim.create_fence(&a, 1).unwrap();
        let fb = sim.create_fence(&b, 1).unwrap();
        let merged = sim.merge_fences(&fa, &fb).unwrap();

        sim.destroy_timeline(a);
        assert_eq!(sim.status(merged.as_raw()), Some(FenceStatus::Active));
        assert_eq!(sim.fence_count_status(&merged, FenceStatus::Active).unwrap(), 1);

        sim.advance_timeline(&b, 1).unwrap();
        assert_eq!(
            sim.status(merged.as_raw()),
            Some(FenceStatus::Error(-libc::ENOENT))
        );
    }

    #[test]
    fn signaled_fences_share_one_timeline() {
        let sim = SimulatedTimelines::new();
        let before = sim.registry.borrow().timelines.len();
        for _ in 0..16 {
            let fence = sim.signaled_fence();
            assert_eq!(sim.status(fence.as_raw()), Some(FenceStatus::Signaled));
        }
        assert_eq!(sim.registry.borrow().timelines.len(), before);
        assert_eq!(sim.open_descriptors(), 0);
    }

    #[test]
    fn raw_descriptors_close_once() {
        let sim = SimulatedTimelines::new();
        let timeline = sim.create_timeline().unwrap();
        let keep = sim.create_fence(&timeline, 1).unwrap();
        let raw = sim.create_fence(&timeline, 1).unwrap().into_raw();

        assert!(sim.descriptor_is_valid(raw));
        sim.destroy_descriptor(raw);
        sim.destroy_descriptor(raw);
        assert!(!sim.descriptor_is_valid(raw));
        assert!(sim.descriptor_is_valid(keep.as_raw()));
        assert_eq!(sim.open_descriptors(), 1);
    }

    #[test]
    fn clone_is_independent() {
        let sim = SimulatedTimelines::new();
        let timeline = sim.create_timeline().unwrap();
        let fence = sim.create_fence(&timeline, 1).unwrap();
        let dup = fence.try_clone().unwrap();
        assert_ne!(dup.as_raw(), fence.as_raw());
        drop(fence);

        sim.advance_timeline(&timeline, 1).unwrap();
        assert_eq!(sim.fence_signal_count(&dup).unwrap(), 1);
    }
}
