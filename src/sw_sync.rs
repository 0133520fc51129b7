use crate::backend::{FenceBackend, FenceStatus, NativeFence};
use crate::{AsRaw, Error, Result};

use libc::{c_char, c_int, c_ulong};
use std::ffi::CString;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

bitflags! {
    /// Access modes checked when probing for a sw_sync device
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: c_int {
        /// The node can be opened for reading
        const READ  = libc::R_OK;
        /// The node can be opened for writing
        const WRITE = libc::W_OK;
    }
}

/// Name given to every fence this crate creates
const FENCE_NAME: &str = "native-fence-sync";

/// Entry point to the kernel's software sync timelines
///
/// Tries a list of device nodes, by default `/dev/sw_sync` and then the
/// debugfs node used by older kernels.
#[derive(Debug, Clone)]
pub struct SwSync {
    paths: Vec<PathBuf>,
}

impl Default for SwSync {
    fn default() -> Self {
        SwSync::new()
    }
}

impl SwSync {
    /// Use the standard device nodes
    pub fn new() -> SwSync {
        SwSync::with_paths([ffi::DEVFS_SW_SYNC, ffi::DEBUGFS_SW_SYNC])
    }

    /// Try the given nodes, in order, instead of the standard ones
    pub fn with_paths<I, P>(paths: I) -> SwSync
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        SwSync {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// The candidate nodes
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Whether any of the nodes is readable and writable
    pub fn is_supported(&self) -> bool {
        self.paths
            .iter()
            .any(|path| has_access(path, Access::READ | Access::WRITE))
    }

    /// Open a new timeline on the first node that can be opened
    pub fn create_timeline(&self) -> Result<Timeline> {
        for path in &self.paths {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => {
                    log::debug!("opened sw_sync timeline at {}", path.display());
                    return Ok(Timeline {
                        fd: OwnedFd::from(file),
                    });
                }
                Err(err) => log::trace!("cannot open {}: {}", path.display(), err),
            }
        }
        Err(Error::ResourceUnavailable)
    }
}

fn has_access(path: &Path, mode: Access) -> bool {
    let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(path.as_ptr(), mode.bits()) == 0 }
}

/// Issue an ioctl, retrying when interrupted by a signal.
///
/// # Safety
///
/// `arg` must point to a properly initialized value of the type `request` expects.
unsafe fn ioctl<T>(
    fd: BorrowedFd<'_>,
    request: c_ulong,
    arg: *mut T,
    operation: &'static str,
) -> Result<()> {
    loop {
        if libc::ioctl(fd.as_raw_fd(), request as _, arg) != -1 {
            return Ok(());
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return Err(Error::last_os_error(operation));
        }
    }
}

fn encode_name(name: &str) -> [c_char; ffi::SYNC_NAME_LEN] {
    let mut out = [0 as c_char; ffi::SYNC_NAME_LEN];
    for (dst, src) in out
        .iter_mut()
        .zip(name.bytes().take(ffi::SYNC_NAME_LEN - 1))
    {
        *dst = src as c_char;
    }
    out
}

fn decode_name(name: &[c_char; ffi::SYNC_NAME_LEN]) -> String {
    let bytes: Vec<u8> = name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Whether `fd` is an open descriptor
pub fn fd_is_valid(fd: RawFd) -> bool {
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0
}

/// Close `fd` unless it is already invalid
pub fn close_fd(fd: RawFd) {
    if fd_is_valid(fd) {
        unsafe { libc::close(fd) };
    }
}

/// A kernel sw_sync timeline
///
/// The counter starts at zero and only moves forward through [`Timeline::advance`].
/// Closing the timeline signals every fence still pending on it with `-ENOENT`.
pub struct Timeline {
    fd: OwnedFd,
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl AsFd for Timeline {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRaw<RawFd> for Timeline {
    fn as_raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Timeline {
    /// Create a fence that signals once the counter reaches `value`
    pub fn create_fence(&self, value: u32) -> Result<SyncFile> {
        let mut data = ffi::sw_sync_create_fence_data {
            value,
            name: encode_name(FENCE_NAME),
            fence: -1,
        };
        unsafe {
            ioctl(
                self.fd.as_fd(),
                ffi::SW_SYNC_IOC_CREATE_FENCE,
                &mut data,
                "SW_SYNC_IOC_CREATE_FENCE",
            )?;
        }
        if data.fence < 0 {
            return Err(Error::OperationFailed {
                operation: "SW_SYNC_IOC_CREATE_FENCE",
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }
        log::trace!("created fence {} at value {}", data.fence, value);
        Ok(unsafe { SyncFile::from_raw_fd(data.fence) })
    }

    /// Move the counter forward by `delta`
    pub fn advance(&self, delta: u32) -> Result<()> {
        let mut arg = delta;
        unsafe {
            ioctl(
                self.fd.as_fd(),
                ffi::SW_SYNC_IOC_INC,
                &mut arg,
                "SW_SYNC_IOC_INC",
            )
        }?;
        log::trace!("advanced timeline {} by {}", self.fd.as_raw_fd(), delta);
        Ok(())
    }
}

/// A sync_file descriptor wrapping one or more dma-fences
pub struct SyncFile {
    fd: OwnedFd,
}

impl fmt::Debug for SyncFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SyncFile")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl AsFd for SyncFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SyncFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRaw<RawFd> for SyncFile {
    fn as_raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FromRawFd for SyncFile {
    unsafe fn from_raw_fd(fd: RawFd) -> SyncFile {
        SyncFile {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for SyncFile {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl From<OwnedFd> for SyncFile {
    fn from(fd: OwnedFd) -> SyncFile {
        SyncFile { fd }
    }
}

/// Decoded `SYNC_IOC_FILE_INFO` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFileInfo {
    /// Name of the sync file
    pub name: String,
    /// Combined status of all fences
    pub status: FenceStatus,
    /// Every fence merged into the sync file
    pub fences: Vec<FenceInfo>,
}

/// One fence of a [`SyncFileInfo`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceInfo {
    /// Name of the timeline the fence belongs to
    pub obj_name: String,
    /// Name of the driver owning the timeline
    pub driver_name: String,
    /// Status of this fence
    pub status: FenceStatus,
    /// Signal time, zero while active
    pub timestamp_ns: u64,
}

impl SyncFile {
    /// Duplicate the descriptor
    pub fn try_clone(&self) -> Result<SyncFile> {
        self.fd
            .try_clone()
            .map(|fd| SyncFile { fd })
            .map_err(|source| Error::OperationFailed {
                operation: "dup",
                source,
            })
    }

    /// Create a sync file that signals once both `self` and `other` have
    pub fn merge(&self, other: &SyncFile) -> Result<SyncFile> {
        let mut data = ffi::sync_merge_data {
            name: encode_name(FENCE_NAME),
            fd2: other.fd.as_raw_fd(),
            fence: -1,
            ..Default::default()
        };
        unsafe {
            ioctl(
                self.fd.as_fd(),
                ffi::SYNC_IOC_MERGE,
                &mut data,
                "SYNC_IOC_MERGE",
            )?;
        }
        Ok(unsafe { SyncFile::from_raw_fd(data.fence) })
    }

    /// Query the state of every fence in this sync file
    pub fn info(&self) -> Result<SyncFileInfo> {
        let mut info = ffi::sync_file_info::default();
        unsafe {
            ioctl(
                self.fd.as_fd(),
                ffi::SYNC_IOC_FILE_INFO,
                &mut info,
                "SYNC_IOC_FILE_INFO",
            )?;
        }

        let mut fences = vec![ffi::sync_fence_info::default(); info.num_fences as usize];
        if !fences.is_empty() {
            info.flags = 0;
            info.num_fences = fences.len() as u32;
            info.sync_fence_info = fences.as_mut_ptr() as usize as u64;
            unsafe {
                ioctl(
                    self.fd.as_fd(),
                    ffi::SYNC_IOC_FILE_INFO,
                    &mut info,
                    "SYNC_IOC_FILE_INFO",
                )?;
            }
            fences.truncate(info.num_fences as usize);
        }

        Ok(SyncFileInfo {
            name: decode_name(&info.name),
            status: FenceStatus::from_raw(info.status),
            fences: fences
                .iter()
                .map(|fence| FenceInfo {
                    obj_name: decode_name(&fence.obj_name),
                    driver_name: decode_name(&fence.driver_name),
                    status: FenceStatus::from_raw(fence.status),
                    timestamp_ns: fence.timestamp_ns,
                })
                .collect(),
        })
    }

    /// Number of fences merged into this sync file
    pub fn size(&self) -> Result<u32> {
        self.info().map(|info| info.fences.len() as u32)
    }

    /// Number of fences in `status`
    pub fn count_status(&self, status: FenceStatus) -> Result<u32> {
        self.info().map(|info| {
            info.fences
                .iter()
                .filter(|fence| fence.status == status)
                .count() as u32
        })
    }
}

impl NativeFence for SyncFile {
    fn try_clone(&self) -> Result<SyncFile> {
        SyncFile::try_clone(self)
    }

    fn into_raw(self) -> RawFd {
        self.into_raw_fd()
    }
}

impl FenceBackend for SwSync {
    type Timeline = Timeline;
    type Fence = SyncFile;

    fn is_supported(&self) -> bool {
        SwSync::is_supported(self)
    }

    fn create_timeline(&self) -> Result<Timeline> {
        SwSync::create_timeline(self)
    }

    fn create_fence(&self, timeline: &Timeline, value: u32) -> Result<SyncFile> {
        timeline.create_fence(value)
    }

    fn advance_timeline(&self, timeline: &Timeline, delta: u32) -> Result<()> {
        timeline.advance(delta)
    }

    fn merge_fences(&self, a: &SyncFile, b: &SyncFile) -> Result<SyncFile> {
        a.merge(b)
    }

    fn fence_size(&self, fence: &SyncFile) -> Result<u32> {
        fence.size()
    }

    fn fence_count_status(&self, fence: &SyncFile, status: FenceStatus) -> Result<u32> {
        fence.count_status(status)
    }

    fn descriptor_is_valid(&self, fd: RawFd) -> bool {
        fd_is_valid(fd)
    }

    fn destroy_descriptor(&self, fd: RawFd) {
        close_fd(fd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sw_sync() -> Option<SwSync> {
        let sw_sync = SwSync::new();
        if sw_sync.is_supported() {
            Some(sw_sync)
        } else {
            eprintln!("sw_sync is not available, skipping");
            None
        }
    }

    #[test]
    fn names_are_truncated_and_terminated() {
        let long = "x".repeat(64);
        let encoded = encode_name(&long);
        assert_eq!(encoded[ffi::SYNC_NAME_LEN - 1], 0);
        assert_eq!(decode_name(&encoded).len(), ffi::SYNC_NAME_LEN - 1);
        assert_eq!(decode_name(&encode_name("fence")), "fence");
    }

    #[test]
    fn missing_nodes_are_unavailable() {
        let sw_sync = SwSync::with_paths(["/nonexistent/sw_sync", "/nonexistent/debug/sw_sync"]);
        assert!(!sw_sync.is_supported());
        assert!(matches!(
            sw_sync.create_timeline(),
            Err(Error::ResourceUnavailable)
        ));
    }

    #[test]
    fn closing_invalid_descriptors_is_a_no_op() {
        assert!(!fd_is_valid(-1));
        close_fd(-1);
        close_fd(i32::MAX);
    }

    #[test]
    fn fence_signals_when_timeline_reaches_value() {
        let Some(sw_sync) = sw_sync() else { return };
        let timeline = sw_sync.create_timeline().unwrap();
        let fence = timeline.create_fence(2).unwrap();

        assert_eq!(fence.size().unwrap(), 1);
        assert_eq!(fence.count_status(FenceStatus::Signaled).unwrap(), 0);

        timeline.advance(1).unwrap();
        assert_eq!(fence.count_status(FenceStatus::Active).unwrap(), 1);

        timeline.advance(1).unwrap();
        let info = fence.info().unwrap();
        assert_eq!(info.status, FenceStatus::Signaled);
        assert_eq!(info.fences[0].status, FenceStatus::Signaled);
    }

    #[test]
    fn merged_fence_reports_each_child() {
        let Some(sw_sync) = sw_sync() else { return };
        let a = sw_sync.create_timeline().unwrap();
        let b = sw_sync.create_timeline().unwrap();
        let merged = a
            .create_fence(1)
            .unwrap()
            .merge(&b.create_fence(1).unwrap())
            .unwrap();

        assert_eq!(merged.size().unwrap(), 2);
        a.advance(1).unwrap();
        assert_eq!(merged.count_status(FenceStatus::Signaled).unwrap(), 1);
        b.advance(1).unwrap();
        assert_eq!(merged.count_status(FenceStatus::Signaled).unwrap(), 2);
    }

    #[test]
    fn duplicate_outlives_original() {
        let Some(sw_sync) = sw_sync() else { return };
        let timeline = sw_sync.create_timeline().unwrap();
        let fence = timeline.create_fence(1).unwrap();
        let dup = fence.try_clone().unwrap();
        drop(fence);

        timeline.advance(1).unwrap();
        assert_eq!(dup.count_status(FenceStatus::Signaled).unwrap(), 1);
    }
}
