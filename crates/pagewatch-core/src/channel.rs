//! Write-fault channel over Linux `userfaultfd(2)`.
//!
//! [`FaultChannel`] owns the userfaultfd descriptor and the set of armed
//! ranges. Arming a range registers it for write-protect faults and sets
//! the protection bit; the next write from any thread then blocks until
//! the fast-path handler reads the fault record and calls
//! [`resolve_write`](FaultChannel::resolve_write) to let it proceed.
//!
//! Requires a kernel that grants `UFFD_FEATURE_PAGEFAULT_FLAG_WP` and
//! `UFFD_FEATURE_THREAD_ID` in the `UFFDIO_API` handshake (5.7+ for
//! write-protect on anonymous mappings). On kernels that restrict
//! unprivileged userfaultfd, opening retries with `UFFD_USER_MODE_ONLY`,
//! which is all this channel needs — watched pages fault from user mode.

use log::{debug, info, warn};
use snafu::{ensure, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

// ═══════════════════════════════════════════════════════════════════════
//  Kernel ABI (linux/userfaultfd.h)
// ═══════════════════════════════════════════════════════════════════════

const UFFD_API_VERSION: u64 = 0xAA;

const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;
const UFFD_FEATURE_THREAD_ID: u64 = 1 << 8;
const REQUIRED_FEATURES: u64 = UFFD_FEATURE_PAGEFAULT_FLAG_WP | UFFD_FEATURE_THREAD_ID;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 1 << 0;
const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

/// `userfaultfd(2)` flag restricting delivery to user-mode faults; lets
/// unprivileged processes open the fd on kernels ≥ 5.11.
const UFFD_USER_MODE_ONLY: libc::c_int = 1;

// _IOC-encoded ioctl requests for the structs below.
const UFFDIO_API: libc::c_ulong = 0xc018_aa3f;
const UFFDIO_REGISTER: libc::c_ulong = 0xc020_aa00;
const UFFDIO_UNREGISTER: libc::c_ulong = 0x8010_aa01;
const UFFDIO_WRITEPROTECT: libc::c_ulong = 0xc018_aa06;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioWriteprotect {
    range: UffdioRange,
    mode: u64,
}

/// Mirrors `struct uffd_msg` for the pagefault event. The kernel struct is
/// packed to 32 bytes; the pagefault arm of its union is the only one this
/// channel ever reads.
#[repr(C)]
#[derive(Clone, Copy)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    pagefault: UffdPagefault,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UffdPagefault {
    flags: u64,
    address: u64,
    ptid: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<UffdioApi>() == 24);
const _: () = assert!(std::mem::size_of::<UffdioRegister>() == 32);
const _: () = assert!(std::mem::size_of::<UffdioWriteprotect>() == 24);
const _: () = assert!(std::mem::size_of::<UffdMsg>() == 32);

/// Largest number of fault records read per poll cycle.
const POLL_BATCH: usize = 16;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Snafu)]
pub enum ChannelError {
    #[snafu(display("userfaultfd syscall failed: {source}"))]
    Open { source: io::Error },

    #[snafu(display("UFFDIO_API handshake failed: {source}"))]
    Handshake { source: io::Error },

    #[snafu(display(
        "kernel does not support write-protect faults with thread ids (features {features:#x})"
    ))]
    MissingFeatures { features: u64 },

    #[snafu(display("range {base:#x}+{len:#x} overlaps an armed range"))]
    Overlap { base: usize, len: usize },

    #[snafu(display("range {base:#x}+{len:#x} is not armed"))]
    NotArmed { base: usize, len: usize },

    #[snafu(display("UFFDIO_REGISTER failed for {base:#x}+{len:#x}: {source}"))]
    Register {
        base: usize,
        len: usize,
        source: io::Error,
    },

    #[snafu(display("UFFDIO_UNREGISTER failed for {base:#x}+{len:#x}: {source}"))]
    Unregister {
        base: usize,
        len: usize,
        source: io::Error,
    },

    #[snafu(display("UFFDIO_WRITEPROTECT failed for {base:#x}+{len:#x}: {source}"))]
    WriteProtect {
        base: usize,
        len: usize,
        source: io::Error,
    },

    #[snafu(display("poll on userfaultfd failed: {source}"))]
    Poll { source: io::Error },

    #[snafu(display("read on userfaultfd failed: {source}"))]
    Read { source: io::Error },
}

fn check(ret: libc::c_long) -> Result<libc::c_long, io::Error> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Fault records
// ═══════════════════════════════════════════════════════════════════════

/// One raw write fault as delivered by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Exact faulting address.
    pub address: u64,
    /// Kernel thread id of the faulting task.
    pub tid: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Channel
// ═══════════════════════════════════════════════════════════════════════

/// Owner of the userfaultfd descriptor and the armed-range table.
///
/// All operations take `&self`: ioctls on the fd are kernel-serialized and
/// the range table sits behind its own mutex, so registration paths can
/// arm and disarm while the fast-path handler polls.
pub struct FaultChannel {
    fd: OwnedFd,
    /// Armed ranges, base → len. Disjoint by construction.
    armed: Mutex<BTreeMap<usize, usize>>,
}

impl FaultChannel {
    /// Open the fault facility in non-blocking mode and negotiate the
    /// required capability set.
    pub fn open() -> Result<Self, ChannelError> {
        let flags = libc::O_CLOEXEC | libc::O_NONBLOCK;
        let mut raw = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
        if raw < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) {
            raw = unsafe { libc::syscall(libc::SYS_userfaultfd, flags | UFFD_USER_MODE_ONLY) };
        }
        let raw = check(raw).context(OpenSnafu)? as RawFd;
        // SAFETY: the syscall returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut api = UffdioApi {
            api: UFFD_API_VERSION,
            features: REQUIRED_FEATURES,
            ioctls: 0,
        };
        check(unsafe { libc::ioctl(fd.as_raw_fd(), UFFDIO_API, &mut api) } as libc::c_long)
            .context(HandshakeSnafu)?;
        ensure!(
            api.features & REQUIRED_FEATURES == REQUIRED_FEATURES,
            MissingFeaturesSnafu {
                features: api.features
            }
        );

        info!(
            "fault channel open (fd {}, features {:#x})",
            fd.as_raw_fd(),
            api.features
        );
        Ok(Self {
            fd,
            armed: Mutex::new(BTreeMap::new()),
        })
    }

    /// Arm `base..base+len` so the next write from any thread faults.
    ///
    /// Fails if the range overlaps an existing arming or the kernel
    /// refuses it.
    pub fn arm(&self, base: usize, len: usize) -> Result<(), ChannelError> {
        let mut armed = self.armed.lock().unwrap();
        let overlaps = armed
            .range(..base + len)
            .next_back()
            .is_some_and(|(&b, &l)| b + l > base);
        ensure!(!overlaps, OverlapSnafu { base, len });

        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: base as u64,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_WP,
            ioctls: 0,
        };
        check(unsafe { libc::ioctl(self.fd.as_raw_fd(), UFFDIO_REGISTER, &mut reg) }
            as libc::c_long)
        .context(RegisterSnafu { base, len })?;

        if let Err(e) = self.write_protect(base, len, true) {
            // Leave no half-armed range behind.
            let range = UffdioRange {
                start: base as u64,
                len: len as u64,
            };
            let _ = check(unsafe { libc::ioctl(self.fd.as_raw_fd(), UFFDIO_UNREGISTER, &range) }
                as libc::c_long);
            return Err(e);
        }

        armed.insert(base, len);
        debug!("armed {base:#x}+{len:#x}");
        Ok(())
    }

    /// Release write-protection for a previously armed range. After this
    /// returns no new faults are generated for the range.
    pub fn disarm(&self, base: usize, len: usize) -> Result<(), ChannelError> {
        let mut armed = self.armed.lock().unwrap();
        ensure!(
            armed.get(&base) == Some(&len),
            NotArmedSnafu { base, len }
        );
        armed.remove(&base);

        if let Err(e) = self.write_protect(base, len, false) {
            warn!("disarm: unprotect failed for {base:#x}+{len:#x}: {e}");
        }
        let range = UffdioRange {
            start: base as u64,
            len: len as u64,
        };
        check(
            unsafe { libc::ioctl(self.fd.as_raw_fd(), UFFDIO_UNREGISTER, &range) } as libc::c_long,
        )
        .context(UnregisterSnafu { base, len })?;
        debug!("disarmed {base:#x}+{len:#x}");
        Ok(())
    }

    /// Best-effort disarm of every armed range, used at shutdown.
    pub fn disarm_all(&self) {
        let ranges: Vec<(usize, usize)> = {
            let armed = self.armed.lock().unwrap();
            armed.iter().map(|(&b, &l)| (b, l)).collect()
        };
        for (base, len) in ranges {
            if let Err(e) = self.disarm(base, len) {
                warn!("disarm_all: {e}");
            }
        }
    }

    /// Block up to `timeout_ms` for fault records; returns a batch of
    /// 0..=16 write faults. `EAGAIN` and `EINTR` yield an empty batch.
    pub fn poll(&self, timeout_ms: i32) -> Result<Vec<FaultRecord>, ChannelError> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(err).context(PollSnafu);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }

        const MSG_SIZE: usize = std::mem::size_of::<UffdMsg>();
        let mut buf = [0u8; POLL_BATCH * MSG_SIZE];
        let nread = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if nread < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(Vec::new());
            }
            return Err(err).context(ReadSnafu);
        }

        let count = nread as usize / MSG_SIZE;
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            // SAFETY: the kernel wrote `count` complete uffd_msg records.
            let msg = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(i * MSG_SIZE) as *const UffdMsg)
            };
            if msg.event != UFFD_EVENT_PAGEFAULT {
                continue;
            }
            let flags = msg.pagefault.flags;
            if flags & (UFFD_PAGEFAULT_FLAG_WRITE | UFFD_PAGEFAULT_FLAG_WP) == 0 {
                continue;
            }
            records.push(FaultRecord {
                address: msg.pagefault.address,
                tid: msg.pagefault.ptid,
            });
        }
        Ok(records)
    }

    /// Let a faulting write proceed, then re-protect the range so the next
    /// first write is observed again. The re-protect step can fail after
    /// the unprotect took effect; the writer is unblocked either way.
    pub fn resolve_write(&self, base: usize, len: usize) -> Result<(), ChannelError> {
        self.write_protect(base, len, false)?;
        self.write_protect(base, len, true)
    }

    /// Number of currently armed ranges.
    pub fn armed_len(&self) -> usize {
        self.armed.lock().unwrap().len()
    }

    fn write_protect(&self, base: usize, len: usize, protect: bool) -> Result<(), ChannelError> {
        let mut wp = UffdioWriteprotect {
            range: UffdioRange {
                start: base as u64,
                len: len as u64,
            },
            mode: if protect {
                UFFDIO_WRITEPROTECT_MODE_WP
            } else {
                0
            },
        };
        check(unsafe { libc::ioctl(self.fd.as_raw_fd(), UFFDIO_WRITEPROTECT, &mut wp) }
            as libc::c_long)
        .context(WriteProtectSnafu { base, len })?;
        Ok(())
    }
}

impl std::fmt::Debug for FaultChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultChannel")
            .field("fd", &self.fd.as_raw_fd())
            .field("armed", &self.armed_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_or_skip() -> Option<FaultChannel> {
        match FaultChannel::open() {
            Ok(channel) => Some(channel),
            Err(e) => {
                eprintln!("skipping: userfaultfd unavailable ({e})");
                None
            }
        }
    }

    fn map_page(pages: usize) -> (usize, usize) {
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
        assert_ne!(ptr, libc::MAP_FAILED);
        // Touch so the pages are present before write-protection.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        (ptr as usize, len)
    }

    #[test]
    fn arm_rejects_overlap() {
        let Some(channel) = open_or_skip() else { return };
        let (base, len) = map_page(2);
        let page = len / 2;

        if let Err(e) = channel.arm(base, len) {
            eprintln!("skipping: write-protect arming unsupported ({e})");
            unsafe { libc::munmap(base as *mut libc::c_void, len) };
            return;
        }
        let err = channel.arm(base + page, page).unwrap_err();
        assert!(matches!(err, ChannelError::Overlap { .. }));
        assert_eq!(channel.armed_len(), 1);

        channel.disarm(base, len).unwrap();
        assert_eq!(channel.armed_len(), 0);
        unsafe { libc::munmap(base as *mut libc::c_void, len) };
    }

    #[test]
    fn disarm_unknown_range_fails() {
        let Some(channel) = open_or_skip() else { return };
        let err = channel.disarm(0x1000, 0x1000).unwrap_err();
        assert!(matches!(err, ChannelError::NotArmed { .. }));
    }

    #[test]
    fn poll_times_out_empty() {
        let Some(channel) = open_or_skip() else { return };
        let records = channel.poll(10).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(std::mem::size_of::<UffdMsg>(), 32);
        assert_eq!(std::mem::size_of::<UffdioApi>(), 24);
    }
}
