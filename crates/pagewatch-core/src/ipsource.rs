//! Recovering the faulting instruction pointer.
//!
//! The kernel's fault record carries the thread id but not the register
//! state, so the ip comes from a per-platform strategy behind
//! [`InstructionPointerSource`]. The default reads the faulting thread's
//! `/proc/<tid>/syscall` file, whose last field is the ip of the blocked
//! task; alternatives (ptrace-based, or none at all) slot in behind the
//! same trait.

/// Strategy for recovering the faulting thread's instruction pointer.
pub trait InstructionPointerSource: Send + Sync {
    /// Best-effort ip for `tid`; 0 when unrecoverable.
    fn instruction_pointer(&self, tid: u32) -> u64;
}

/// Reads `/proc/<tid>/syscall` while the thread is blocked in the fault.
///
/// While a task is stopped in a syscall (or a fault the kernel services on
/// its behalf), the file holds one line ending in the saved stack pointer
/// and instruction pointer in hex.
#[derive(Debug, Default)]
pub struct ProcSyscallIpSource;

impl InstructionPointerSource for ProcSyscallIpSource {
    fn instruction_pointer(&self, tid: u32) -> u64 {
        let path = format!("/proc/{tid}/syscall");
        match std::fs::read_to_string(path) {
            Ok(contents) => parse_syscall_ip(&contents),
            Err(_) => 0,
        }
    }
}

/// Always reports 0, for platforms without a usable per-thread state file.
#[derive(Debug, Default)]
pub struct NullIpSource;

impl InstructionPointerSource for NullIpSource {
    fn instruction_pointer(&self, _tid: u32) -> u64 {
        0
    }
}

/// Parse the last hex field of a `/proc/<tid>/syscall` line. The file
/// reads `running` for tasks not blocked in the kernel; that and any other
/// malformed content yield 0.
fn parse_syscall_ip(contents: &str) -> u64 {
    let line = contents.lines().next().unwrap_or("");
    let last = match line.rsplit(' ').next() {
        Some(field) if !field.is_empty() => field,
        _ => return 0,
    };
    let digits = last.strip_prefix("0x").unwrap_or(last);
    u64::from_str_radix(digits, 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_ip_field() {
        let line = "1 0x3 0x7ffd0 0x0 0x0 0x0 0x0 0x7ffd12345678 0x7f1122334455\n";
        assert_eq!(parse_syscall_ip(line), 0x7f11_2233_4455);
    }

    #[test]
    fn running_task_yields_zero() {
        assert_eq!(parse_syscall_ip("running\n"), 0);
    }

    #[test]
    fn garbage_yields_zero() {
        assert_eq!(parse_syscall_ip(""), 0);
        assert_eq!(parse_syscall_ip("not hex at all"), 0);
    }

    #[test]
    fn missing_thread_yields_zero() {
        // tid 0 never exists.
        assert_eq!(ProcSyscallIpSource.instruction_pointer(0), 0);
    }
}
