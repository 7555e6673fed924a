//! Named shared memory, mutex and frame events.
//!
//! Platform layer for the bus: a POSIX shared-memory object plus three
//! named semaphores standing in for the Windows-style named mutex and
//! auto-reset events of the protocol. The synth process creates (and on
//! shutdown unlinks) every object; the host only ever opens existing ones,
//! so its mapping lifetime is independent of the synth's.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::layout::{BusHeader, IN_REGION_OFFSET, OUT_REGION_OFFSET, SLOT_SAMPLES};
use crate::BusError;

use permabus_core::tunables::NUM_CHANNELS;
use permabus_core::ChannelCount;

/// Well-known base name of the bus. Region and mutex names derive from it
/// directly; event names additionally embed the synth PID so several synth
/// instances can coexist.
pub const DEFAULT_BUS_NAME: &str = "/omab_bus";

pub(crate) fn region_name(base: &str) -> String {
    base.to_string()
}

pub(crate) fn mutex_name(base: &str) -> String {
    format!("{base}_mutex")
}

pub(crate) fn audio_ready_name(base: &str, pid: u32) -> String {
    format!("{base}_audio_ready_{pid}")
}

pub(crate) fn processed_ready_name(base: &str, pid: u32) -> String {
    format!("{base}_processed_ready_{pid}")
}

fn c_name(name: &str) -> Result<CString, BusError> {
    CString::new(name).map_err(|_| BusError::InvalidName)
}

/// A mapped POSIX shared-memory object.
///
/// The creator owns the name: its `Drop` unlinks the object. An opener
/// only unmaps its own view.
#[derive(Debug)]
pub(crate) struct SharedMemory {
    fd: libc::c_int,
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    owner: bool,
}

impl SharedMemory {
    /// Create a fresh, zeroed object of `size` bytes under `name`,
    /// replacing any stale object a crashed previous instance left behind.
    #[allow(unsafe_code)]
    pub(crate) fn create(name: &str, size: usize) -> Result<Self, BusError> {
        let c_name = c_name(name)?;

        // A leftover object from a crashed synth would otherwise make
        // O_EXCL fail forever.
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(BusError::Mapping(io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(BusError::Mapping(err));
        }

        Self::map(fd, size, c_name, true)
    }

    /// Open an existing object and verify it is at least `size` bytes.
    #[allow(unsafe_code)]
    pub(crate) fn open(name: &str, size: usize) -> Result<Self, BusError> {
        let c_name = c_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
        if fd < 0 {
            return Err(BusError::Mapping(io::Error::last_os_error()));
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(BusError::Mapping(err));
        }
        let actual = unsafe { stat.assume_init() }.st_size as usize;
        if actual < size {
            unsafe { libc::close(fd) };
            return Err(BusError::Mapping(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("region is {actual} bytes, expected at least {size}"),
            )));
        }

        Self::map(fd, size, c_name, false)
    }

    #[allow(unsafe_code)]
    fn map(fd: libc::c_int, size: usize, name: CString, owner: bool) -> Result<Self, BusError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                if owner {
                    libc::shm_unlink(name.as_ptr());
                }
            }
            return Err(BusError::View(err));
        }

        Ok(Self {
            fd,
            // mmap returned something other than MAP_FAILED, so non-null
            ptr: NonNull::new(ptr.cast::<u8>()).expect("mmap returned null"),
            size,
            name,
            owner,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
            libc::close(self.fd);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

// The region is explicitly designed to be shared; access discipline lives
// in the header's atomics and the bus mutex.
#[allow(unsafe_code)]
unsafe impl Send for SharedMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for SharedMemory {}

/// A named POSIX semaphore, the building block for both the bus mutex
/// (initial count 1) and the frame events (initial count 0).
#[derive(Debug)]
struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

impl NamedSemaphore {
    #[allow(unsafe_code)]
    fn create(name: &str, initial: u32) -> Result<Self, io::Error> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interior NUL"))?;

        // Same stale-object concern as the region itself.
        unsafe {
            libc::sem_unlink(c_name.as_ptr());
        }

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: c_name,
            owner: true,
        })
    }

    #[allow(unsafe_code)]
    fn open(name: &str) -> Result<Self, io::Error> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interior NUL"))?;

        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: c_name,
            owner: false,
        })
    }

    #[allow(unsafe_code)]
    fn post(&self) {
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    #[allow(unsafe_code)]
    fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    /// Block until acquired. Only management paths use this.
    #[allow(unsafe_code)]
    fn wait(&self) {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Acquire within `timeout`; `false` on expiry.
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return self.wait_timeout_polling(timeout);
        }
        let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        let deadline = libc::timespec {
            tv_sec: now.tv_sec
                + timeout.as_secs() as libc::time_t
                + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return true;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }

    /// Acquire within `timeout`; `false` on expiry. `sem_timedwait` is not
    /// portable beyond Linux, so elsewhere this polls against a deadline.
    #[cfg(not(target_os = "linux"))]
    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_timeout_polling(timeout)
    }

    #[cfg_attr(target_os = "linux", allow(dead_code))]
    fn wait_timeout_polling(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Consume any pending counts.
    fn drain(&self) {
        while self.try_wait() {}
    }
}

impl Drop for NamedSemaphore {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

#[allow(unsafe_code)]
unsafe impl Send for NamedSemaphore {}
#[allow(unsafe_code)]
unsafe impl Sync for NamedSemaphore {}

/// Cross-process mutex guarding multi-field header writes.
///
/// Realtime paths only ever `try_lock`; management paths may block, with
/// [`NamedMutex::lock_timeout`] bounding the wait where a crashed peer
/// holding the mutex must not wedge us (shutdown, takeover requests).
#[derive(Debug)]
pub(crate) struct NamedMutex {
    sem: NamedSemaphore,
}

impl NamedMutex {
    pub(crate) fn create(name: &str) -> Result<Self, io::Error> {
        Ok(Self {
            sem: NamedSemaphore::create(name, 1)?,
        })
    }

    pub(crate) fn open(name: &str) -> Result<Self, io::Error> {
        Ok(Self {
            sem: NamedSemaphore::open(name)?,
        })
    }

    /// Non-blocking acquire; `None` means somebody else holds it and the
    /// caller should skip its update.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.sem.try_wait().then_some(MutexGuard { sem: &self.sem })
    }

    /// Blocking acquire, management paths only.
    pub(crate) fn lock(&self) -> MutexGuard<'_> {
        self.sem.wait();
        MutexGuard { sem: &self.sem }
    }

    /// Bounded acquire; `None` on expiry.
    pub(crate) fn lock_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_>> {
        self.sem
            .wait_timeout(timeout)
            .then_some(MutexGuard { sem: &self.sem })
    }
}

/// Releases the mutex on drop.
pub(crate) struct MutexGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.sem.post();
    }
}

/// Cross-process frame event in auto-reset style: `set` posts, a
/// successful wait consumes the post.
#[derive(Debug)]
pub(crate) struct NamedEvent {
    sem: NamedSemaphore,
}

impl NamedEvent {
    pub(crate) fn create(name: &str) -> Result<Self, io::Error> {
        Ok(Self {
            sem: NamedSemaphore::create(name, 0)?,
        })
    }

    pub(crate) fn open(name: &str) -> Result<Self, io::Error> {
        Ok(Self {
            sem: NamedSemaphore::open(name)?,
        })
    }

    pub(crate) fn set(&self) {
        self.sem.post();
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.sem.wait_timeout(timeout)
    }

    /// Discard stale signals, used when (re)arming the exchange so a post
    /// from a dead host cannot satisfy a fresh frame's wait.
    pub(crate) fn drain(&self) {
        self.sem.drain();
    }
}

/// The whole bus at the OS level: region, mutex, and the two frame events.
#[derive(Debug)]
pub(crate) struct BusRegion {
    pub(crate) shm: SharedMemory,
    pub(crate) mutex: NamedMutex,
    pub(crate) audio_ready: NamedEvent,
    pub(crate) processed_ready: NamedEvent,
}

impl BusRegion {
    /// Create every OS object for a new bus. On partial failure the
    /// already-created objects are released (and unlinked) by their drops.
    pub(crate) fn create(base: &str, pid: u32, size: usize) -> Result<Self, BusError> {
        let shm = SharedMemory::create(&region_name(base), size)?;
        let mutex = NamedMutex::create(&mutex_name(base)).map_err(BusError::Mutex)?;
        let audio_ready =
            NamedEvent::create(&audio_ready_name(base, pid)).map_err(BusError::Event)?;
        let processed_ready =
            NamedEvent::create(&processed_ready_name(base, pid)).map_err(BusError::Event)?;
        Ok(Self {
            shm,
            mutex,
            audio_ready,
            processed_ready,
        })
    }

    #[allow(unsafe_code)]
    pub(crate) fn header(&self) -> &BusHeader {
        // The header is the first HEADER_SIZE bytes of the mapping; the
        // layout module proves size and alignment at compile time.
        unsafe { &*self.shm.as_ptr().cast::<BusHeader>() }
    }

    /// Base of one out-area exchange buffer (`buffer` is 0 for A, 1 for B).
    #[allow(unsafe_code)]
    pub(crate) fn out_slot(&self, channel: ChannelCount, buffer: usize) -> *mut f32 {
        debug_assert!(channel < NUM_CHANNELS && buffer < 2);
        let offset = OUT_REGION_OFFSET + (channel * 2 + buffer) * SLOT_SAMPLES * 4;
        unsafe { self.shm.as_ptr().add(offset).cast::<f32>() }
    }

    /// Base of one in-area exchange buffer.
    #[allow(unsafe_code)]
    pub(crate) fn in_slot(&self, buffer: usize) -> *mut f32 {
        debug_assert!(buffer < 2);
        let offset = IN_REGION_OFFSET + buffer * SLOT_SAMPLES * 4;
        unsafe { self.shm.as_ptr().add(offset).cast::<f32>() }
    }
}

#[cfg(test)]
pub(crate) fn test_bus_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    // Unique names keep parallel tests from opening each other's regions.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "/permabus_t_{}_{}_{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn test_shared_memory_create_and_open() {
        let name = test_bus_name("shm");
        let size = 4096;

        let creator = SharedMemory::create(&name, size).expect("create shm");
        assert_eq!(creator.size(), size);

        unsafe {
            *creator.as_ptr() = 42;
            *creator.as_ptr().add(100) = 123;
        }

        let reader = SharedMemory::open(&name, size).expect("open shm");
        unsafe {
            assert_eq!(*reader.as_ptr(), 42);
            assert_eq!(*reader.as_ptr().add(100), 123);
        }
    }

    #[test]
    fn test_shared_memory_open_missing() {
        let name = test_bus_name("absent");
        assert!(SharedMemory::open(&name, 4096).is_err());
    }

    #[test]
    fn test_shared_memory_create_zeroes() {
        let name = test_bus_name("zero");
        let shm = SharedMemory::create(&name, 4096).expect("create shm");
        #[allow(unsafe_code)]
        let bytes = unsafe { std::slice::from_raw_parts(shm.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_event_set_and_wait() {
        let name = test_bus_name("evt");
        let event = NamedEvent::create(&name).expect("create event");

        // No signal pending: a short wait expires.
        assert!(!event.wait(Duration::from_millis(10)));

        event.set();
        assert!(event.wait(Duration::from_millis(10)));
        // The wait consumed the signal.
        assert!(!event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_event_drain() {
        let name = test_bus_name("drain");
        let event = NamedEvent::create(&name).expect("create event");
        event.set();
        event.set();
        event.drain();
        assert!(!event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_event_cross_handle() {
        let name = test_bus_name("evt2");
        let creator = NamedEvent::create(&name).expect("create event");
        let opener = NamedEvent::open(&name).expect("open event");
        opener.set();
        assert!(creator.wait(Duration::from_millis(100)));
    }

    #[test]
    fn test_mutex_exclusion() {
        let name = test_bus_name("mtx");
        let mutex = NamedMutex::create(&name).expect("create mutex");

        let guard = mutex.try_lock().expect("uncontended try_lock");
        assert!(mutex.try_lock().is_none());
        assert!(mutex.lock_timeout(Duration::from_millis(20)).is_none());
        drop(guard);

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_bus_region_create() {
        let name = test_bus_name("region");
        let region =
            BusRegion::create(&name, std::process::id(), crate::REGION_SIZE).expect("create");
        // Fresh region is zeroed, so the header reads as empty/Direct.
        assert_eq!(region.header().state(), crate::TakeoverState::Direct);
        assert_eq!(region.header().flags(), 0);
    }
}
