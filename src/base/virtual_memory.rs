use super::memory_region::MemoryRegion;
use super::round_up;

/// One reserved, read-write span of virtual address space. The heap reserves
/// its whole maximum capacity up front and carves pages out of it; the OS
/// backs the range lazily, so reserving far more than will ever be touched
/// is cheap.
pub struct VirtualMemory {
    region: MemoryRegion,
    reserved: MemoryRegion,
}

impl VirtualMemory {
    pub fn start(&self) -> usize {
        self.region.start()
    }

    pub fn end(&self) -> usize {
        self.region.end()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn address(&self) -> *mut u8 {
        self.region.pointer()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.region.contains(address)
    }
}

pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        } else {
            4096
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::ptr::null_mut;

        unsafe fn unmap(start: usize, end: usize) {
            let size = end - start;
            if size == 0 {
                return;
            }

            if libc::munmap(start as _, size) != 0 {
                panic!("munmap failed");
            }
        }

        impl VirtualMemory {
            /// Reserves `size` bytes aligned to `alignment`. The mapping is
            /// readable and writable but unbacked (`MAP_NORESERVE`) until
            /// touched.
            pub fn reserve_aligned(size: usize, alignment: usize) -> Option<Self> {
                let allocated_size = size + alignment - page_size();

                unsafe {
                    let addr = libc::mmap(
                        null_mut(),
                        allocated_size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                        -1,
                        0,
                    );

                    if addr == libc::MAP_FAILED {
                        return None;
                    }

                    let base = addr as usize;
                    let aligned_base = round_up(base, alignment);

                    // Trim the misaligned head and tail back to the OS.
                    unmap(base, aligned_base);
                    unmap(aligned_base + size, base + allocated_size);

                    let region = MemoryRegion::new(aligned_base, size);
                    Some(Self {
                        region,
                        reserved: region,
                    })
                }
            }

            /// Hints the OS that `[start, start + size)` no longer needs its
            /// backing memory. The range stays mapped and reads back as zero.
            pub fn release(&self, start: usize, size: usize) {
                debug_assert!(self.region.contains_region(&MemoryRegion::new(start, size)));
                unsafe {
                    libc::madvise(start as _, size, libc::MADV_DONTNEED);
                }
            }
        }

        impl Drop for VirtualMemory {
            fn drop(&mut self) {
                unsafe {
                    unmap(self.reserved.start(), self.reserved.end());
                }
            }
        }
    } else if #[cfg(windows)] {
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
        use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

        impl VirtualMemory {
            pub fn reserve_aligned(size: usize, alignment: usize) -> Option<Self> {
                let allocated_size = size + alignment;

                unsafe {
                    let addr = VirtualAlloc(
                        std::ptr::null_mut(),
                        allocated_size,
                        MEM_RESERVE | MEM_COMMIT,
                        PAGE_READWRITE,
                    );

                    if addr.is_null() {
                        return None;
                    }

                    let base = addr as usize;
                    let aligned_base = round_up(base, alignment);

                    // Windows cannot free partial reservations; keep the
                    // whole mapping and use the aligned interior.
                    Some(Self {
                        region: MemoryRegion::new(aligned_base, size),
                        reserved: MemoryRegion::new(base, allocated_size),
                    })
                }
            }

            pub fn release(&self, _start: usize, _size: usize) {}
        }

        impl Drop for VirtualMemory {
            fn drop(&mut self) {
                unsafe {
                    VirtualFree(self.reserved.pointer() as _, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}
