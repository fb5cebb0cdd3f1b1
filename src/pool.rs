//! Fixed-size value pool and pointer compression.
//!
//! Exactly [`POOL_SIZE`] cells are laid out contiguously and threaded
//! into a LIFO free list through their heap-node payloads. Allocation
//! pops, freeing pushes. The pool is never grown; exhaustion is handled
//! one level up by running the collector and retrying.
//!
//! A [`ValueRef`] is the compressed form of a cell address: the slot
//! index stored in 16 bits. [`compress`] and [`decompress`] convert
//! between slot indices and references and must round-trip exactly,
//! which the interpreter verifies once at startup.

use crate::value::{Cell, CellValue, ValueRef};

/// Number of cells in the pool.
pub const POOL_SIZE: usize = 9000;

const _: () = assert!(POOL_SIZE <= u16::MAX as usize);

/// Compress a pool slot index into a 16-bit reference.
#[inline]
pub fn compress(slot: usize) -> ValueRef {
    debug_assert!(slot < POOL_SIZE);
    ValueRef(slot as u16)
}

/// Recover the pool slot index from a compressed reference.
#[inline]
pub fn decompress(value: ValueRef) -> usize {
    value.0 as usize
}

pub struct ValuePool {
    cells: Vec<Cell>,
    free: Option<ValueRef>,
}

impl ValuePool {
    pub fn new() -> ValuePool {
        let mut cells = Vec::with_capacity(POOL_SIZE);
        for i in 0..POOL_SIZE {
            // Thread slot i in front of everything allocated so far.
            let next = if i == 0 {
                None
            } else {
                Some(compress(i - 1))
            };
            cells.push(Cell {
                alive: false,
                marked: false,
                value: CellValue::HeapNode { next },
            });
        }
        ValuePool {
            cells,
            free: Some(compress(POOL_SIZE - 1)),
        }
    }

    /// Pop a cell off the free list. The caller owns initialization of
    /// the payload; the header comes back alive and unmarked.
    pub fn alloc(&mut self) -> Option<ValueRef> {
        let head = self.free?;
        let cell = &mut self.cells[decompress(head)];
        self.free = match cell.value {
            CellValue::HeapNode { next } => next,
            // A live cell on the free list means the list is corrupt.
            _ => None,
        };
        cell.alive = true;
        cell.marked = false;
        Some(head)
    }

    /// Return a cell to the free list. Replacing the payload drops
    /// whatever the cell owned, which is the finalizer step: a data
    /// buffer releases its scratch handle here, every other variant has
    /// nothing to release.
    pub fn free(&mut self, value: ValueRef) {
        let cell = &mut self.cells[decompress(value)];
        cell.alive = false;
        cell.marked = false;
        cell.value = CellValue::HeapNode { next: self.free };
        self.free = Some(value);
    }

    #[inline]
    pub fn cell(&self, value: ValueRef) -> &Cell {
        &self.cells[decompress(value)]
    }

    #[inline]
    pub fn cell_mut(&mut self, value: ValueRef) -> &mut Cell {
        &mut self.cells[decompress(value)]
    }

    /// Length of the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.free;
        while let Some(v) = current {
            count += 1;
            current = match self.cell(v).value {
                CellValue::HeapNode { next } => next,
                _ => None,
            };
        }
        count
    }
}

impl Default for ValuePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeTag;

    #[test]
    fn test_compression_round_trip() {
        for slot in [0usize, 1, 497, POOL_SIZE - 1] {
            assert_eq!(decompress(compress(slot)), slot);
        }
    }

    #[test]
    fn test_alloc_pops_lifo() {
        let mut pool = ValuePool::new();
        let first = pool.alloc().unwrap();
        // Slots were threaded 0..POOL_SIZE, so the head is the last slot.
        assert_eq!(decompress(first), POOL_SIZE - 1);
        assert!(pool.cell(first).alive);

        let second = pool.alloc().unwrap();
        assert_eq!(decompress(second), POOL_SIZE - 2);

        // Freeing puts a cell back at the head.
        pool.free(second);
        let third = pool.alloc().unwrap();
        assert_eq!(third, second);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut pool = ValuePool::new();
        for _ in 0..POOL_SIZE {
            assert!(pool.alloc().is_some());
        }
        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_free_restores_heap_node() {
        let mut pool = ValuePool::new();
        let v = pool.alloc().unwrap();
        pool.cell_mut(v).value = CellValue::Integer(7);
        pool.free(v);
        assert!(!pool.cell(v).alive);
        assert_eq!(pool.cell(v).value.type_tag(), TypeTag::HeapNode);
    }

    #[test]
    fn test_free_count_full_pool() {
        let pool = ValuePool::new();
        assert_eq!(pool.free_count(), POOL_SIZE);
    }
}
