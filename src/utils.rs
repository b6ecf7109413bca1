use std::error::Error;
use std::fs::File;
use std::ops::Range;
#[cfg(target_family = "unix")]
use std::os::fd::AsRawFd;

pub type DynError = Box<dyn Error + Send + Sync>;

#[cfg(target_family = "unix")]
pub fn advise_file_sequential(file: &File) {
    let fd = file.as_raw_fd();
    unsafe {
        let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_family = "unix"))]
pub fn advise_file_sequential(_file: &File) {}

#[cfg(target_family = "unix")]
pub fn available_cores() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(not(target_family = "unix"))]
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Splits `range` into at most `parts` contiguous, non-empty, ordered sub-ranges.
pub fn split_contiguous(range: Range<usize>, parts: usize) -> Vec<Range<usize>> {
    let total = range.end.saturating_sub(range.start);
    if total == 0 || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(total);
    let base = total / parts;
    let extra = total % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = range.start;
    for k in 0..parts {
        let len = base + usize::from(k < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}
