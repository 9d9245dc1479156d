//! Best-effort thread placement. Every helper degrades to a no-op with a
//! warning; a refused request never fails the pipeline.

use spdlog::warn;

/// Pin the calling thread to one CPU.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(
                "pinning to cpu {} failed: {}",
                cpu,
                std::io::Error::last_os_error()
            );
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(cpu: usize) -> bool {
    warn!("cpu pinning unsupported on this platform (requested cpu {})", cpu);
    false
}

/// Request SCHED_FIFO at `priority` for the calling thread. Usually needs
/// CAP_SYS_NICE.
#[cfg(target_os = "linux")]
pub fn set_realtime(priority: i32) -> bool {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(
                "realtime scheduling (priority {}) refused: {}",
                priority,
                std::io::Error::last_os_error()
            );
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime(priority: i32) -> bool {
    warn!(
        "realtime scheduling unsupported on this platform (requested priority {})",
        priority
    );
    false
}

/// Lock current and future pages into RAM.
#[cfg(target_os = "linux")]
pub fn lock_process_memory() -> bool {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            "mlockall refused: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn lock_process_memory() -> bool {
    warn!("memory locking unsupported on this platform");
    false
}
