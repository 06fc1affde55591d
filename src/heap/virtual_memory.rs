use once_cell::sync::Lazy;
use std::io;
use std::ptr::null_mut;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        } else {
            4096
        }
    }
});

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// A reserved (initially inaccessible) chunk of address space from which the
/// heap commits and uncommits region-granular slices.
pub struct VirtualMemory {
    start: usize,
    size: usize,
}

unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Reserves `size` bytes aligned to `alignment` (a multiple of the page
    /// size). The mapping starts out PROT_NONE; commit before use.
    pub fn reserve(size: usize, alignment: usize) -> io::Result<Self> {
        assert!(alignment.is_power_of_two());
        assert!(super::is_aligned(size, page_size()));

        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    // Over-reserve so an aligned start always exists, then trim
                    // the slack from both ends.
                    let padded = size + alignment;
                    let raw = libc::mmap(
                        null_mut(),
                        padded,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                        -1,
                        0,
                    );
                    if raw == libc::MAP_FAILED {
                        return Err(io::Error::last_os_error());
                    }

                    let raw = raw as usize;
                    let aligned = super::align_up(raw, alignment);
                    let head = aligned - raw;
                    let tail = padded - head - size;
                    if head != 0 {
                        libc::munmap(raw as _, head);
                    }
                    if tail != 0 {
                        libc::munmap((aligned + size) as _, tail);
                    }

                    Ok(Self {
                        start: aligned,
                        size,
                    })
                }
            } else {
                let _ = (size, alignment);
                unimplemented!("virtual memory reservation is only implemented for unix targets")
            }
        }
    }

    /// Makes `[addr, addr + len)` accessible. Panics on failure: running out
    /// of commit charge at this point is not recoverable.
    pub fn commit(&self, addr: usize, len: usize) {
        debug_assert!(addr >= self.start && addr + len <= self.end());
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let result = unsafe {
                    libc::mprotect(addr as _, len, libc::PROT_READ | libc::PROT_WRITE)
                };
                assert_eq!(result, 0, "failed to commit heap memory: {}", io::Error::last_os_error());
            } else {
                let _ = (addr, len);
            }
        }
    }

    /// Returns `[addr, addr + len)` to the kernel and makes it inaccessible.
    pub fn uncommit(&self, addr: usize, len: usize) {
        debug_assert!(addr >= self.start && addr + len <= self.end());
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    libc::madvise(addr as _, len, libc::MADV_DONTNEED);
                    libc::mprotect(addr as _, len, libc::PROT_NONE);
                }
            } else {
                let _ = (addr, len);
            }
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    libc::munmap(self.start as _, self.size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VirtualMemory;

    #[test]
    fn reserve_commit_rw() {
        let alignment = 256 * 1024;
        let vm = VirtualMemory::reserve(alignment * 4, alignment).unwrap();
        assert_eq!(vm.start() % alignment, 0);
        vm.commit(vm.start(), alignment);
        unsafe {
            let p = vm.start() as *mut usize;
            p.write(42);
            assert_eq!(p.read(), 42);
        }
        vm.uncommit(vm.start(), alignment);
    }
}
