// id.rs — Arena handles for regions
//
// Regions refer to their parent through these indices instead of pointers, so
// cloning a routine is a plain arena copy and no reference cycles exist.

/// Index of a region inside one routine's `RegionArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocator for region ids. Produces monotonically increasing ids in
/// allocation order, so arena order equals construction order.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_region: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_region(&mut self) -> RegionId {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        id
    }

    pub fn allocated(&self) -> usize {
        self.next_region as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_allocation_order() {
        let mut alloc = IdAllocator::new();
        let a = alloc.alloc_region();
        let b = alloc.alloc_region();
        assert!(a < b);
        assert_eq!(b.index(), 1);
        assert_eq!(alloc.allocated(), 2);
    }
}
