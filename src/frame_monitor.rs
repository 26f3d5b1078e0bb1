//! Frame monitor module for reading the injection host's depth samples.
//!
//! The host publishes one record per rendered frame into a shared memory
//! segment; this module maps it and surfaces new frames to the control loop.

use crate::error::ShmError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared memory segment name for the host's per-frame depth data.
pub const FRAME_SHM_NAME: &str = "/autoconv-frame";

/// Ring buffer capacity for frame samples (240 samples = 2 seconds at 120 fps).
pub const RING_BUFFER_CAPACITY: usize = 240;

/// C-compatible struct matching the host's shared memory layout.
///
/// `#[repr(C)]` keeps the layout stable across the C ABI so the raw bytes
/// published by the injection host can be reinterpreted safely.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameRecord {
    /// Monotonically increasing frame counter.
    pub frame: u64,
    /// View-space depth of the nearest relevant fragment.
    pub nearest_w: f32,
    /// Elapsed frame time in seconds.
    pub frame_time: f32,
}

impl FrameRecord {
    /// Create a new FrameRecord instance.
    pub fn new(frame: u64, nearest_w: f32, frame_time: f32) -> Self {
        Self {
            frame,
            nearest_w,
            frame_time,
        }
    }

    /// Convert raw bytes to FrameRecord using unsafe pointer casting.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - `ptr` points to valid memory of at least `size_of::<FrameRecord>()` bytes
    /// - The memory is properly aligned for FrameRecord
    /// - The memory contains valid data in the expected C layout
    pub unsafe fn from_raw_ptr(ptr: *const u8) -> Self {
        let record_ptr = ptr as *const FrameRecord;
        std::ptr::read_volatile(record_ptr)
    }

    /// Write FrameRecord to a raw byte buffer.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - `ptr` points to valid, writable memory of at least `size_of::<FrameRecord>()` bytes
    /// - The memory is properly aligned for FrameRecord
    pub unsafe fn to_raw_ptr(&self, ptr: *mut u8) {
        let record_ptr = ptr as *mut FrameRecord;
        std::ptr::write_volatile(record_ptr, *self);
    }

    /// Get the size of the struct in bytes.
    pub const fn size() -> usize {
        std::mem::size_of::<FrameRecord>()
    }
}

/// A single frame sample with the time it was observed.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// Frame counter at the time of sampling.
    pub frame: u64,
    /// Nearest relevant depth for this frame.
    pub nearest_w: f32,
    /// Elapsed frame time in seconds.
    pub frame_time: f32,
    /// Timestamp when the sample was observed.
    pub timestamp: Instant,
}

impl FrameSnapshot {
    /// Create a new snapshot with the current timestamp.
    pub fn new(frame: u64, nearest_w: f32, frame_time: f32) -> Self {
        Self {
            frame,
            nearest_w,
            frame_time,
            timestamp: Instant::now(),
        }
    }
}

/// Ring buffer for storing frame samples with fixed capacity.
///
/// Keeps a short window of recent frames for smoothing and diagnostics.
#[derive(Debug)]
pub struct FrameRingBuffer {
    samples: VecDeque<FrameSnapshot>,
    capacity: usize,
}

impl FrameRingBuffer {
    /// Create a new ring buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(RING_BUFFER_CAPACITY)
    }

    /// Create a new ring buffer with a specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a new sample to the buffer, removing the oldest if at capacity.
    pub fn push(&mut self, sample: FrameSnapshot) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Smallest nearest-depth over the buffered window.
    /// Returns None if the buffer is empty.
    pub fn min_nearest_w(&self) -> Option<f32> {
        self.samples
            .iter()
            .map(|s| s.nearest_w)
            .fold(None, |acc, w| match acc {
                None => Some(w),
                Some(m) => Some(m.min(w)),
            })
    }

    /// Average frame time over the buffered window.
    /// Returns 0.0 if the buffer is empty.
    pub fn average_frame_time(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s.frame_time).sum();
        sum / self.samples.len() as f32
    }

    /// Get the current number of samples in the buffer.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get the capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear all samples from the buffer.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Get an iterator over all samples.
    pub fn iter(&self) -> impl Iterator<Item = &FrameSnapshot> {
        self.samples.iter()
    }
}

impl Default for FrameRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader for the host's frame segment.
///
/// Only available on Unix-like systems where POSIX shared memory is
/// supported.
#[cfg(target_family = "unix")]
pub struct FrameReader {
    /// Pointer to the mapped shared memory.
    shm_ptr: *const FrameRecord,
    /// File descriptor for the shared memory segment.
    shm_fd: i32,
    /// Ring buffer of observed samples.
    ring_buffer: Arc<Mutex<FrameRingBuffer>>,
    /// Last frame counter surfaced to the control loop.
    last_frame: AtomicU64,
    /// Size of the mapped memory region.
    shm_size: usize,
}

#[cfg(target_family = "unix")]
// Safety: FrameReader can be sent between threads because:
// - shm_ptr points to shared memory that remains valid for the lifetime of the reader
// - shm_fd is just an integer file descriptor
// - ring_buffer is protected by Arc<Mutex<>>, last_frame is atomic
unsafe impl Send for FrameReader {}
#[cfg(target_family = "unix")]
unsafe impl Sync for FrameReader {}

#[cfg(target_family = "unix")]
impl FrameReader {
    /// Connect to the host's frame shared memory segment.
    pub fn new() -> Result<Self, ShmError> {
        use libc::{c_char, close, mmap, shm_open, MAP_FAILED, MAP_SHARED, O_RDONLY, PROT_READ};
        use std::ffi::CString;

        let shm_name = CString::new(FRAME_SHM_NAME)
            .map_err(|_| ShmError::InvalidData("Invalid SHM name".to_string()))?;

        // Open the shared memory segment
        let shm_fd = unsafe { shm_open(shm_name.as_ptr() as *const c_char, O_RDONLY, 0) };

        if shm_fd < 0 {
            return Err(ShmError::OpenFailed {
                name: FRAME_SHM_NAME.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        let shm_size = FrameRecord::size();

        // Map the shared memory into our address space
        let shm_ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                shm_size,
                PROT_READ,
                MAP_SHARED,
                shm_fd,
                0,
            )
        };

        if shm_ptr == MAP_FAILED {
            unsafe { close(shm_fd) };
            return Err(ShmError::MmapFailed(std::io::Error::last_os_error()));
        }

        Ok(Self {
            shm_ptr: shm_ptr as *const FrameRecord,
            shm_fd,
            ring_buffer: Arc::new(Mutex::new(FrameRingBuffer::new())),
            last_frame: AtomicU64::new(0),
            shm_size,
        })
    }

    /// Poll the segment for a new frame.
    ///
    /// Returns `Ok(None)` while the host has not published a new frame, or
    /// `Ok(Some(snapshot))` exactly once per published frame. A frame
    /// counter moving backwards means the host restarted, which is surfaced
    /// as an error so the caller reconnects.
    pub fn poll(&self) -> Result<Option<FrameSnapshot>, ShmError> {
        let record = unsafe { FrameRecord::from_raw_ptr(self.shm_ptr as *const u8) };

        if !record.nearest_w.is_finite() || !record.frame_time.is_finite() {
            return Err(ShmError::InvalidData(format!(
                "non-finite frame data: nearest_w={}, frame_time={}",
                record.nearest_w, record.frame_time
            )));
        }

        let last = self.last_frame.load(Ordering::Acquire);
        if record.frame == last {
            return Ok(None);
        }
        if record.frame < last {
            return Err(ShmError::InvalidData(format!(
                "frame counter went backwards ({} -> {}), host restarted?",
                last, record.frame
            )));
        }
        self.last_frame.store(record.frame, Ordering::Release);

        let snapshot = FrameSnapshot::new(record.frame, record.nearest_w, record.frame_time);
        if let Ok(mut buffer) = self.ring_buffer.lock() {
            buffer.push(snapshot.clone());
        }

        Ok(Some(snapshot))
    }

    /// Average frame time over the recent window.
    pub fn smoothed_frame_time(&self) -> f32 {
        self.ring_buffer
            .lock()
            .map(|buffer| buffer.average_frame_time())
            .unwrap_or(0.0)
    }

    /// Get a clone of the ring buffer Arc for external access.
    pub fn ring_buffer(&self) -> Arc<Mutex<FrameRingBuffer>> {
        Arc::clone(&self.ring_buffer)
    }
}

#[cfg(target_family = "unix")]
impl Drop for FrameReader {
    fn drop(&mut self) {
        use libc::{close, munmap};

        // Unmap the shared memory
        if !self.shm_ptr.is_null() {
            unsafe {
                munmap(self.shm_ptr as *mut libc::c_void, self.shm_size);
            }
        }

        // Close the file descriptor
        if self.shm_fd >= 0 {
            unsafe {
                close(self.shm_fd);
            }
        }
    }
}

/// Stub implementation for non-Unix platforms for development/testing.
#[cfg(not(target_family = "unix"))]
pub struct FrameReader {
    ring_buffer: Arc<Mutex<FrameRingBuffer>>,
}

#[cfg(not(target_family = "unix"))]
impl FrameReader {
    /// Stub: Returns NotAvailable on non-Unix platforms.
    pub fn new() -> Result<Self, ShmError> {
        Err(ShmError::NotAvailable)
    }

    /// Stub: Returns NotAvailable on non-Unix platforms.
    pub fn poll(&self) -> Result<Option<FrameSnapshot>, ShmError> {
        Err(ShmError::NotAvailable)
    }

    /// Stub: Returns 0.0 on non-Unix platforms.
    pub fn smoothed_frame_time(&self) -> f32 {
        0.0
    }

    /// Get a clone of the ring buffer Arc for external access.
    pub fn ring_buffer(&self) -> Arc<Mutex<FrameRingBuffer>> {
        Arc::clone(&self.ring_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Frame records survive a round-trip through raw shared-memory bytes.
    proptest! {
        #[test]
        fn prop_frame_record_round_trip(
            frame in 0u64..u64::MAX,
            nearest_w in 0.0f32..10000.0,
            frame_time in 0.0f32..1.0,
        ) {
            let original = FrameRecord::new(frame, nearest_w, frame_time);

            // Allocate a buffer to simulate shared memory
            let mut buffer = vec![0u8; FrameRecord::size()];

            unsafe {
                original.to_raw_ptr(buffer.as_mut_ptr());
            }
            let recovered = unsafe { FrameRecord::from_raw_ptr(buffer.as_ptr()) };

            prop_assert_eq!(original, recovered);
        }
    }

    // The ring buffer never grows past its capacity and keeps the most
    // recent samples.
    proptest! {
        #[test]
        fn prop_ring_buffer_capacity_invariant(
            samples in prop::collection::vec((0.01f32..100.0, 0.001f32..0.1), 0..600)
        ) {
            let mut buffer = FrameRingBuffer::new();

            for (i, (nearest_w, frame_time)) in samples.iter().enumerate() {
                buffer.push(FrameSnapshot::new(i as u64, *nearest_w, *frame_time));
                prop_assert!(buffer.len() <= RING_BUFFER_CAPACITY);
            }

            if samples.len() > RING_BUFFER_CAPACITY {
                prop_assert_eq!(buffer.len(), RING_BUFFER_CAPACITY);

                // Verify we kept the most recent samples
                let expected_start = samples.len() - RING_BUFFER_CAPACITY;
                for (i, sample) in buffer.iter().enumerate() {
                    prop_assert_eq!(sample.frame, (expected_start + i) as u64);
                }
            } else {
                prop_assert_eq!(buffer.len(), samples.len());
            }
        }
    }

    #[test]
    fn test_frame_record_size() {
        // FrameRecord should be 16 bytes (u64 + 2 x f32)
        assert_eq!(FrameRecord::size(), 16);
    }

    #[test]
    fn test_ring_buffer_min_nearest_w() {
        let mut buffer = FrameRingBuffer::new();

        assert_eq!(buffer.min_nearest_w(), None);

        buffer.push(FrameSnapshot::new(1, 4.0, 0.016));
        buffer.push(FrameSnapshot::new(2, 0.5, 0.016));
        buffer.push(FrameSnapshot::new(3, 12.0, 0.016));

        assert_eq!(buffer.min_nearest_w(), Some(0.5));
    }

    #[test]
    fn test_ring_buffer_average_frame_time() {
        let mut buffer = FrameRingBuffer::new();

        assert_eq!(buffer.average_frame_time(), 0.0);

        buffer.push(FrameSnapshot::new(1, 1.0, 0.010));
        buffer.push(FrameSnapshot::new(2, 1.0, 0.020));
        buffer.push(FrameSnapshot::new(3, 1.0, 0.030));

        assert!((buffer.average_frame_time() - 0.020).abs() < 1e-6);
    }

    #[test]
    fn test_ring_buffer_capacity_enforcement() {
        let mut buffer = FrameRingBuffer::with_capacity(5);

        for i in 0..10 {
            buffer.push(FrameSnapshot::new(i, i as f32, 0.016));
        }

        assert_eq!(buffer.len(), 5);

        let frames: Vec<u64> = buffer.iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![5, 6, 7, 8, 9]);
    }
}
