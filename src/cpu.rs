//! CPU pinning and real-time scheduling helpers shared by every worker thread
//! in the datapath (RX workers, the writeback thread, the relay/forwarding
//! demos under `demos/`).

use std::io;

/// return the CPU the calling thread is currently running on.
pub fn get_cpu() -> io::Result<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(cpu as usize)
    }
}

/// pin the calling thread to the given set of CPUs.
pub fn set_cpu_affinity(cpus: impl IntoIterator<Item = usize>) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// return the valid SCHED_FIFO priority range for this system.
pub fn fifo_priority_bounds() -> io::Result<(i32, i32)> {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if min == -1 || max == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((min, max))
    }
}

/// set the calling thread to SCHED_FIFO with the given priority.
pub fn set_current_thread_sched_fifo(priority: i32) -> io::Result<()> {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// raise then drop a set of Linux capabilities around a fallible setup closure,
/// leaving the calling thread with neither on success or failure (mirrors the
/// capability discipline the teacher applies around AF_XDP socket creation).
#[cfg(target_os = "linux")]
pub fn with_net_caps<T>(
    caps: &[caps::Capability],
    f: impl FnOnce() -> io::Result<T>,
) -> io::Result<T> {
    use caps::CapSet;

    for cap in caps {
        caps::raise(None, CapSet::Effective, *cap)
            .map_err(|e| io::Error::other(format!("raise {cap:?}: {e}")))?;
    }
    let result = f();
    for cap in caps {
        let _ = caps::drop(None, CapSet::Effective, *cap);
    }
    result
}
