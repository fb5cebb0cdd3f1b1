//! Mark-and-sweep collection.
//!
//! Non-moving, stop-the-world, precise. The root set: nil, the
//! out-of-memory cell, the current lexical bindings, the macro list,
//! every operand stack entry, every node of the globals tree, the
//! currently executing function, and every registered protected root.
//! The shared string-packing buffer is deliberately not a root; the
//! sweep clears that slot when nothing else keeps the buffer alive.
//!
//! Marking recurses over pair cars, function captures, string buffers
//! and error contexts, but walks pair cdr chains iteratively so long
//! lists cannot overflow the host stack.

use crate::interp::Interp;
use crate::pool::{compress, POOL_SIZE};
use crate::value::{CellValue, TypeTag, ValueRef};

impl Interp {
    /// Run a full mark/sweep cycle. Returns the number of cells
    /// reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        self.gc_mark();
        self.gc_sweep()
    }

    fn gc_mark(&mut self) {
        self.mark_value(self.nil);
        self.mark_value(self.oom);
        self.mark_value(self.lexical_bindings);
        self.mark_value(self.macros);

        for i in 0..self.operand_stack.len() {
            let v = self.operand_stack[i];
            self.mark_value(v);
        }

        let root = self.globals_tree;
        self.globals_tree_traverse(root, &mut |interp, kvp, node| {
            interp.cell_mut(node).marked = true;
            let links = interp.cdr(node);
            interp.cell_mut(links).marked = true;
            interp.mark_value(kvp);
        });

        self.mark_value(self.this_fn);

        for i in 0..self.protected.len() {
            let v = self.protected[i];
            self.mark_value(v);
        }
    }

    fn mark_value(&mut self, value: ValueRef) {
        if self.cell(value).marked {
            return;
        }
        // Mark before visiting children so self-referential captures
        // terminate.
        self.cell_mut(value).marked = true;

        match self.cell(value).value {
            CellValue::SourceFunction { code, bindings }
            | CellValue::BytecodeFunction { code, bindings } => {
                self.mark_value(code);
                self.mark_value(bindings);
            }
            CellValue::String { buffer, .. } => {
                self.mark_value(buffer);
            }
            CellValue::Error { context, .. } => {
                self.mark_value(context);
            }
            CellValue::Cons { .. } => {
                // Recurse on cars, walk the cdr chain in place.
                let mut current = value;
                loop {
                    let car = self.car(current);
                    self.mark_value(car);
                    let next = self.cdr(current);
                    if self.type_of(next) == TypeTag::Cons {
                        if self.cell(next).marked {
                            return;
                        }
                        self.cell_mut(next).marked = true;
                        current = next;
                    } else {
                        self.mark_value(next);
                        return;
                    }
                }
            }
            _ => {}
        }
    }

    fn gc_sweep(&mut self) -> usize {
        if !self.cell(self.string_buffer).marked {
            self.string_buffer = self.nil;
        }

        let mut collect_count = 0;
        for slot in 0..POOL_SIZE {
            let v = compress(slot);
            let (alive, marked) = {
                let cell = self.cell(v);
                (cell.alive, cell.marked)
            };
            if alive {
                if marked {
                    self.cell_mut(v).marked = false;
                } else {
                    // Freeing replaces the payload, dropping anything
                    // the cell owned (the data-buffer finalizer).
                    self.pool.free(v);
                    collect_count += 1;
                }
            }
        }
        collect_count
    }

    /// Visit every live cell. Used by diagnostics (`interp-stat`).
    pub fn live_values(&self, mut visit: impl FnMut(ValueRef, &CellValue)) {
        for slot in 0..POOL_SIZE {
            let v = compress(slot);
            let cell = self.cell(v);
            if cell.alive {
                visit(v, &cell.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    fn test_interp() -> Interp {
        Interp::new(Box::new(StdPlatform))
    }

    #[test]
    fn test_unrooted_garbage_is_reclaimed() {
        let mut interp = test_interp();
        interp.collect_garbage();
        let before = interp.pool.free_count();
        for i in 0..100 {
            interp.make_integer(i);
        }
        interp.collect_garbage();
        assert_eq!(interp.pool.free_count(), before);
    }

    #[test]
    fn test_protected_root_survives() {
        let mut interp = test_interp();
        let kept = interp.make_integer(777);
        interp.gc_protect(kept);
        for i in 0..50 {
            interp.make_integer(i);
        }
        interp.collect_garbage();
        assert_eq!(interp.integer_value(kept), 777);
        interp.gc_unprotect();
    }

    #[test]
    fn test_second_collection_frees_nothing() {
        let mut interp = test_interp();
        for i in 0..200 {
            interp.make_integer(i);
        }
        interp.collect_garbage();
        assert_eq!(interp.collect_garbage(), 0);
    }

    #[test]
    fn test_pool_exhaustion_triggers_collection() {
        let mut interp = test_interp();
        // Allocate more cells than the pool holds; everything unrooted
        // becomes garbage and gets reclaimed along the way.
        for i in 0..(POOL_SIZE + 1) {
            let v = interp.make_integer(i as i32);
            assert_ne!(v, interp.oom());
        }
    }

    #[test]
    fn test_exhaustion_with_rooted_values_returns_oom() {
        let mut interp = test_interp();
        // Root a long list that consumes the whole pool; the next
        // allocation cannot succeed even after collection.
        interp.gc_protect(interp.nil());
        let slot = interp.protected.len() - 1;
        loop {
            let head = interp.protected[slot];
            let next = interp.make_cons(interp.nil(), head);
            if next == interp.oom() {
                break;
            }
            interp.protected[slot] = next;
        }
        let v = interp.make_integer(1);
        assert_eq!(v, interp.oom());
        // The distinguished cells survive the pressure.
        assert_eq!(interp.type_of(interp.nil()), crate::value::TypeTag::Nil);
        assert!(interp.is_error(interp.oom()));
        interp.gc_unprotect();
    }

    #[test]
    fn test_globals_survive_collection() {
        let mut interp = test_interp();
        let v = interp.make_integer(31337);
        interp.set_var_by_name("treasure", v);
        for i in 0..500 {
            interp.make_integer(i);
        }
        interp.collect_garbage();
        let found = interp.get_var_by_name("treasure");
        assert_eq!(interp.integer_value(found), 31337);
    }

    #[test]
    fn test_string_buffer_slot_cleared_when_unreachable() {
        let mut interp = test_interp();
        let s = interp.make_string("ephemeral");
        assert_ne!(interp.string_buffer, interp.nil());
        let _ = s; // unrooted
        interp.collect_garbage();
        assert_eq!(interp.string_buffer, interp.nil());
    }

    #[test]
    fn test_string_buffer_slot_kept_while_string_live() {
        let mut interp = test_interp();
        let s = interp.make_string("durable");
        interp.gc_protect(s);
        interp.collect_garbage();
        assert_ne!(interp.string_buffer, interp.nil());
        assert_eq!(interp.string_value(s), "durable");
        interp.gc_unprotect();
    }
}
