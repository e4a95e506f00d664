//! Shared helpers for integration tests.
//!
//! Everything that needs a real userfaultfd goes through [`init_core`],
//! which skips the test (with a note) on kernels or sandboxes where the
//! facility is unavailable.

use pagewatch_core::{CoreConfig, WatchCore};

#[allow(dead_code)]
pub fn init_core(config: CoreConfig) -> Option<WatchCore> {
    let _ = env_logger::builder().is_test(true).try_init();
    let core = WatchCore::new();
    match core.initialize(config) {
        Ok(()) => Some(core),
        Err(e) => {
            eprintln!("skipping: userfaultfd unavailable ({e})");
            None
        }
    }
}

#[allow(dead_code)]
pub fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Page-aligned anonymous mapping standing in for host-owned memory.
/// Touched (zeroed) at creation so pages are present before arming.
pub struct PageAlloc {
    base: usize,
    len: usize,
}

#[allow(dead_code)]
impl PageAlloc {
    pub fn new(pages: usize) -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = page * pages;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        Self {
            base: ptr as usize,
            len,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn write(&self, offset: usize, byte: u8) {
        assert!(offset < self.len);
        unsafe { std::ptr::write_volatile((self.base + offset) as *mut u8, byte) };
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}
