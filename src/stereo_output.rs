//! Stereo output module publishing the convergence value to the host.
//!
//! The daemon owns two small shared memory segments: one record the host's
//! stereo compositor reads every frame, and one fixed-size text region the
//! host overlay renders as the on-screen display.

use crate::error::SinkError;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Shared memory segment name for the convergence record.
pub const STEREO_SHM_NAME: &str = "/autoconv-stereo";

/// Shared memory segment name for the OSD text region.
pub const OSD_SHM_NAME: &str = "/autoconv-osd";

/// Capacity of the OSD text buffer in bytes.
pub const OSD_TEXT_CAPACITY: usize = 52;

/// C-compatible record the stereo compositor reads each frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoRecord {
    /// Incremented on every write so the host can detect updates.
    pub seq: u64,
    /// Active convergence distance for this frame.
    pub convergence: f32,
    /// Nonzero while the anti-judder lock pins the value low.
    pub locked_low: u32,
}

impl StereoRecord {
    /// Convert raw bytes to StereoRecord using unsafe pointer casting.
    ///
    /// # Safety
    /// `ptr` must point to valid, aligned memory of at least
    /// `size_of::<StereoRecord>()` bytes in the expected C layout.
    pub unsafe fn from_raw_ptr(ptr: *const u8) -> Self {
        std::ptr::read_volatile(ptr as *const StereoRecord)
    }

    /// Write StereoRecord to a raw byte buffer.
    ///
    /// # Safety
    /// `ptr` must point to valid, writable, aligned memory of at least
    /// `size_of::<StereoRecord>()` bytes.
    pub unsafe fn to_raw_ptr(&self, ptr: *mut u8) {
        std::ptr::write_volatile(ptr as *mut StereoRecord, *self);
    }

    /// Get the size of the struct in bytes.
    pub const fn size() -> usize {
        std::mem::size_of::<StereoRecord>()
    }
}

/// C-compatible OSD text region the host overlay renders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OsdRecord {
    /// Incremented on every write so the host can detect updates.
    pub seq: u64,
    /// Number of valid bytes in `text`.
    pub len: u32,
    /// UTF-8 text, not NUL-terminated.
    pub text: [u8; OSD_TEXT_CAPACITY],
}

impl Default for OsdRecord {
    fn default() -> Self {
        Self {
            seq: 0,
            len: 0,
            text: [0; OSD_TEXT_CAPACITY],
        }
    }
}

impl OsdRecord {
    /// Get the size of the struct in bytes.
    pub const fn size() -> usize {
        std::mem::size_of::<OsdRecord>()
    }
}

/// Clamp a convergence value to the configured range.
pub fn clamp_convergence(value: f32, min: f32, max: f32) -> f32 {
    let (min, max) = if min > max { (max, min) } else { (min, max) };
    value.clamp(min, max)
}

/// Encode OSD text into a fixed buffer, truncating on a char boundary.
pub fn encode_osd_text(text: &str) -> ([u8; OSD_TEXT_CAPACITY], u32) {
    let mut buf = [0u8; OSD_TEXT_CAPACITY];
    let mut end = text.len().min(OSD_TEXT_CAPACITY);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    buf[..end].copy_from_slice(&text.as_bytes()[..end]);
    (buf, end as u32)
}

/// Publishes convergence values and OSD text to the injection host.
///
/// Only available on Unix-like systems; the daemon creates both segments so
/// the host can map them at its leisure.
#[cfg(target_family = "unix")]
pub struct StereoSink {
    /// Pointer to the mapped convergence record.
    stereo_ptr: *mut StereoRecord,
    stereo_fd: i32,
    /// Pointer to the mapped OSD region.
    osd_ptr: *mut OsdRecord,
    osd_fd: i32,
    /// Configured range, stored as f32 bit patterns for atomic access.
    min_bits: AtomicU32,
    max_bits: AtomicU32,
    /// Last written convergence bits; initialized to NaN so the first
    /// write always goes through.
    last_bits: AtomicU32,
    last_locked: AtomicBool,
    seq: AtomicU64,
    osd_seq: AtomicU64,
}

#[cfg(target_family = "unix")]
// Safety: the mapped pointers stay valid for the sink's lifetime and every
// mutable field is atomic; concurrent writers interleave whole records.
unsafe impl Send for StereoSink {}
#[cfg(target_family = "unix")]
unsafe impl Sync for StereoSink {}

#[cfg(target_family = "unix")]
impl StereoSink {
    /// Create both output segments with the given convergence range.
    pub fn new(min: f32, max: f32) -> Result<Self, SinkError> {
        let (stereo_ptr, stereo_fd) = Self::create_segment(STEREO_SHM_NAME, StereoRecord::size())?;
        let (osd_ptr, osd_fd) = match Self::create_segment(OSD_SHM_NAME, OsdRecord::size()) {
            Ok(pair) => pair,
            Err(e) => {
                unsafe {
                    libc::munmap(stereo_ptr as *mut libc::c_void, StereoRecord::size());
                    libc::close(stereo_fd);
                }
                if let Ok(cname) = std::ffi::CString::new(STEREO_SHM_NAME) {
                    unsafe {
                        libc::shm_unlink(cname.as_ptr());
                    }
                }
                return Err(e);
            }
        };

        let (min, max) = if min > max { (max, min) } else { (min, max) };

        Ok(Self {
            stereo_ptr: stereo_ptr as *mut StereoRecord,
            stereo_fd,
            osd_ptr: osd_ptr as *mut OsdRecord,
            osd_fd,
            min_bits: AtomicU32::new(min.to_bits()),
            max_bits: AtomicU32::new(max.to_bits()),
            last_bits: AtomicU32::new(f32::NAN.to_bits()),
            last_locked: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            osd_seq: AtomicU64::new(0),
        })
    }

    /// shm_open + ftruncate + mmap for one daemon-owned segment.
    fn create_segment(name: &str, size: usize) -> Result<(*mut u8, i32), SinkError> {
        use libc::{c_char, close, ftruncate, mmap, shm_open, MAP_FAILED, MAP_SHARED, O_CREAT, O_RDWR, PROT_READ, PROT_WRITE};
        use std::ffi::CString;

        let shm_name = CString::new(name).map_err(|_| SinkError::CreateFailed {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid SHM name"),
        })?;

        let fd = unsafe { shm_open(shm_name.as_ptr() as *const c_char, O_CREAT | O_RDWR, 0o600) };
        if fd < 0 {
            return Err(SinkError::CreateFailed {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        if unsafe { ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(SinkError::TruncateFailed(err));
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(SinkError::MmapFailed(err));
        }

        Ok((ptr as *mut u8, fd))
    }

    /// Clamp a value to the configured convergence range.
    pub fn clamp(&self, value: f32) -> f32 {
        clamp_convergence(
            value,
            f32::from_bits(self.min_bits.load(Ordering::Relaxed)),
            f32::from_bits(self.max_bits.load(Ordering::Relaxed)),
        )
    }

    /// Publish a convergence value for the current frame.
    ///
    /// Returns true if a new record was written, false when the value and
    /// lock state are unchanged and the write was skipped.
    pub fn set_convergence(&self, value: f32, locked_low: bool) -> bool {
        let clamped = self.clamp(value);
        let bits = clamped.to_bits();

        let unchanged = self.last_bits.load(Ordering::Relaxed) == bits
            && self.last_locked.load(Ordering::Relaxed) == locked_low;
        if unchanged {
            return false;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = StereoRecord {
            seq,
            convergence: clamped,
            locked_low: locked_low as u32,
        };
        unsafe {
            record.to_raw_ptr(self.stereo_ptr as *mut u8);
        }

        self.last_bits.store(bits, Ordering::Relaxed);
        self.last_locked.store(locked_low, Ordering::Relaxed);
        true
    }

    /// Last convergence value written, or None before the first write.
    pub fn last_convergence(&self) -> Option<f32> {
        let value = f32::from_bits(self.last_bits.load(Ordering::Relaxed));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    /// Update the convergence range.
    pub fn set_range(&self, min: f32, max: f32) {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        self.min_bits.store(min.to_bits(), Ordering::Relaxed);
        self.max_bits.store(max.to_bits(), Ordering::Relaxed);
    }

    /// Publish a line of OSD text for the host overlay.
    pub fn show_osd(&self, text: &str) {
        let (buf, len) = encode_osd_text(text);
        let seq = self.osd_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = OsdRecord {
            seq,
            len,
            text: buf,
        };
        unsafe {
            std::ptr::write_volatile(self.osd_ptr, record);
        }
    }
}

#[cfg(target_family = "unix")]
impl Drop for StereoSink {
    fn drop(&mut self) {
        use libc::{c_char, close, munmap, shm_unlink};
        use std::ffi::CString;

        unsafe {
            munmap(self.stereo_ptr as *mut libc::c_void, StereoRecord::size());
            munmap(self.osd_ptr as *mut libc::c_void, OsdRecord::size());
            close(self.stereo_fd);
            close(self.osd_fd);
        }

        // The daemon created these segments; drop their names with it.
        for name in [STEREO_SHM_NAME, OSD_SHM_NAME] {
            if let Ok(cname) = CString::new(name) {
                unsafe {
                    shm_unlink(cname.as_ptr() as *const c_char);
                }
            }
        }
    }
}

/// Stub implementation for non-Unix platforms for development/testing.
#[cfg(not(target_family = "unix"))]
pub struct StereoSink {
    min_bits: AtomicU32,
    max_bits: AtomicU32,
    last_bits: AtomicU32,
    last_locked: AtomicBool,
}

#[cfg(not(target_family = "unix"))]
impl StereoSink {
    /// Stub: keeps the clamp behavior but publishes nothing.
    pub fn new(min: f32, max: f32) -> Result<Self, SinkError> {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        Ok(Self {
            min_bits: AtomicU32::new(min.to_bits()),
            max_bits: AtomicU32::new(max.to_bits()),
            last_bits: AtomicU32::new(f32::NAN.to_bits()),
            last_locked: AtomicBool::new(false),
        })
    }

    pub fn clamp(&self, value: f32) -> f32 {
        clamp_convergence(
            value,
            f32::from_bits(self.min_bits.load(Ordering::Relaxed)),
            f32::from_bits(self.max_bits.load(Ordering::Relaxed)),
        )
    }

    pub fn set_convergence(&self, value: f32, locked_low: bool) -> bool {
        let bits = self.clamp(value).to_bits();
        let unchanged = self.last_bits.load(Ordering::Relaxed) == bits
            && self.last_locked.load(Ordering::Relaxed) == locked_low;
        if unchanged {
            return false;
        }
        self.last_bits.store(bits, Ordering::Relaxed);
        self.last_locked.store(locked_low, Ordering::Relaxed);
        true
    }

    pub fn last_convergence(&self) -> Option<f32> {
        let value = f32::from_bits(self.last_bits.load(Ordering::Relaxed));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub fn set_range(&self, min: f32, max: f32) {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        self.min_bits.store(min.to_bits(), Ordering::Relaxed);
        self.max_bits.store(max.to_bits(), Ordering::Relaxed);
    }

    pub fn show_osd(&self, _text: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Clamped values always land within the configured range, regardless of
    // the order the bounds are given in.
    proptest! {
        #[test]
        fn prop_convergence_clamping(
            requested in -10.0f32..10.0,
            a in 0.0f32..5.0,
            b in 0.0f32..5.0,
        ) {
            let (min, max) = if a > b { (b, a) } else { (a, b) };
            let clamped = clamp_convergence(requested, a, b);

            prop_assert!(clamped >= min);
            prop_assert!(clamped <= max);

            if requested >= min && requested <= max {
                prop_assert_eq!(clamped, requested);
            }
        }
    }

    #[test]
    fn test_stereo_record_size() {
        // StereoRecord should be 16 bytes (u64 + f32 + u32)
        assert_eq!(StereoRecord::size(), 16);
    }

    #[test]
    fn test_osd_record_size() {
        // OsdRecord should be 64 bytes (u64 + u32 + 52 text bytes)
        assert_eq!(OsdRecord::size(), 64);
    }

    #[test]
    fn test_stereo_record_round_trip() {
        let original = StereoRecord {
            seq: 42,
            convergence: 0.37,
            locked_low: 1,
        };
        let mut buffer = vec![0u8; StereoRecord::size()];
        unsafe {
            original.to_raw_ptr(buffer.as_mut_ptr());
        }
        let recovered = unsafe { StereoRecord::from_raw_ptr(buffer.as_ptr()) };
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_encode_osd_text_plain() {
        let (buf, len) = encode_osd_text("popout 0.35");
        assert_eq!(len, 11);
        assert_eq!(&buf[..11], b"popout 0.35");
        assert!(buf[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_encode_osd_text_truncates() {
        let long = "x".repeat(200);
        let (buf, len) = encode_osd_text(&long);
        assert_eq!(len as usize, OSD_TEXT_CAPACITY);
        assert!(buf.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn test_encode_osd_text_respects_char_boundary() {
        // 26 two-byte characters = 52 bytes, then one more would split.
        let text = "é".repeat(27);
        let (_, len) = encode_osd_text(&text);
        assert_eq!(len as usize, 52);

        let text = "a".to_string() + &"é".repeat(26);
        let (_, len) = encode_osd_text(&text);
        // 1 + 26 * 2 = 53 bytes total, must stop at 51 to keep chars whole.
        assert_eq!(len as usize, 51);
    }
}
