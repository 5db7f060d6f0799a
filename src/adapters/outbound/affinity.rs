//! Thread pinning for worker tasks.
//!
//! Linux only, via `pthread_setaffinity_np`. Elsewhere pinning reports
//! `Unsupported` and tasks run wherever the OS puts them.

use std::io;

#[cfg(target_os = "linux")]
pub const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[cfg(not(target_os = "linux"))]
pub const CPU_SET_CAPACITY: usize = 1024;

fn validate(cpus: &[usize]) -> io::Result<()> {
    if cpus.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty cpu set"));
    }
    if let Some(cpu) = cpus.iter().find(|c| **c >= CPU_SET_CAPACITY) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {} exceeds CPU_SET_CAPACITY ({})", cpu, CPU_SET_CAPACITY),
        ));
    }
    Ok(())
}

/// Restrict the calling thread to `cpus`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpus: &[usize]) -> io::Result<()> {
    validate(cpus)?;
    // SAFETY: a zeroed cpu_set_t is valid, every index was bounds-checked
    // above, and pthread_setaffinity_np reports errors through its return code.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const _,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpus: &[usize]) -> io::Result<()> {
    validate(cpus)?;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_and_empty_sets() {
        assert_eq!(
            pin_current_thread(&[]).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            pin_current_thread(&[CPU_SET_CAPACITY]).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
