use bitvec::vec::BitVec;

/// Bit-level free list for descriptor table indices.
///
/// Indices are dense from zero: freed slots are reused before the range
/// grows, which keeps bindless tables compact.
#[derive(Default)]
pub struct IdAlloc {
    bits: BitVec,
}

impl IdAlloc {
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
        }
    }

    /// Hands out the lowest free index.
    pub fn alloc_one(&mut self) -> u32 {
        if let Some(index) = self.bits.first_zero() {
            self.bits.set(index, true);
            return index as u32;
        }
        let index = self.bits.len();
        self.bits.push(true);
        index as u32
    }

    /// Returns `id` to the free list.
    pub fn free(&mut self, id: u32) {
        self.bits.set(id as usize, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_one_dense() {
        let mut alloc = IdAlloc::new();
        assert_eq!(alloc.alloc_one(), 0);
        assert_eq!(alloc.alloc_one(), 1);
        assert_eq!(alloc.alloc_one(), 2);
    }

    #[test]
    fn test_free_then_reuse() {
        let mut alloc = IdAlloc::new();
        alloc.alloc_one();
        alloc.alloc_one();
        alloc.alloc_one();
        alloc.free(1);
        assert_eq!(alloc.alloc_one(), 1);
        assert_eq!(alloc.alloc_one(), 3);
    }

    #[test]
    fn test_lowest_hole_wins() {
        let mut alloc = IdAlloc::new();
        for _ in 0..5 {
            alloc.alloc_one();
        }
        alloc.free(3);
        alloc.free(0);
        assert_eq!(alloc.alloc_one(), 0);
        assert_eq!(alloc.alloc_one(), 3);
        assert_eq!(alloc.alloc_one(), 5);
    }
}
