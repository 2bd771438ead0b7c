//! Worker thread scheduling

use pconv_core::SchedPolicy;
use std::io;

/// Apply `policy` at `priority` to the calling thread. The priority is
/// clamped to the range the policy supports. `SchedPolicy::Other` leaves
/// the thread untouched.
#[cfg(unix)]
pub fn apply_to_current_thread(priority: i32, policy: SchedPolicy) -> io::Result<()> {
    let policy = match policy {
        SchedPolicy::Other => return Ok(()),
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::RoundRobin => libc::SCHED_RR,
    };
    unsafe {
        let min = libc::sched_get_priority_min(policy);
        let max = libc::sched_get_priority_max(policy);
        if min < 0 || max < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority.clamp(min, max);
        let rc = libc::pthread_setschedparam(libc::pthread_self(), policy, &param);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_to_current_thread(_priority: i32, policy: SchedPolicy) -> io::Result<()> {
    match policy {
        SchedPolicy::Other => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "real-time scheduling not available on this platform",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_policy_is_noop() {
        assert!(apply_to_current_thread(50, SchedPolicy::Other).is_ok());
    }

    #[test]
    fn test_fifo_never_panics() {
        // Unprivileged processes get EPERM; either outcome is fine.
        let _ = std::thread::spawn(|| apply_to_current_thread(10, SchedPolicy::Fifo))
            .join()
            .unwrap();
    }
}
