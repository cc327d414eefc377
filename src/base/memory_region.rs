/// A plain start/size view of a contiguous address range. Carries no
/// ownership; the mapping behind it is managed by `VirtualMemory`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRegion {
    start: usize,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub const fn empty() -> Self {
        Self { start: 0, size: 0 }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn pointer(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub const fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.start + self.size
    }

    pub const fn contains_region(&self, other: &MemoryRegion) -> bool {
        self.contains(other.start) && other.end() <= self.end()
    }
}
