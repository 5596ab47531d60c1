//! Table instance: a growable vector of references behind a reader/writer
//! lock, bounds-checked on every access.

use std::sync::RwLock;

use super::value::Ref;
use crate::ast::types::TableType;
use crate::error::Trap;

#[derive(Debug)]
pub struct TableInstance {
    ty: TableType,
    elems: RwLock<Vec<Ref>>,
}

impl TableInstance {
    pub fn new(ty: TableType, init: Ref) -> Self {
        let elems = vec![init; ty.limits.min as usize];
        Self { ty, elems: RwLock::new(elems) }
    }

    pub fn ty(&self) -> &TableType {
        &self.ty
    }

    pub fn size(&self) -> u32 {
        self.elems.read().expect("table lock").len() as u32
    }

    pub fn get(&self, idx: u32) -> Result<Ref, Trap> {
        self.elems
            .read()
            .expect("table lock")
            .get(idx as usize)
            .cloned()
            .ok_or(Trap::OutOfBounds)
    }

    pub fn set(&self, idx: u32, val: Ref) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("table lock");
        let slot = elems.get_mut(idx as usize).ok_or(Trap::OutOfBounds)?;
        *slot = val;
        Ok(())
    }

    /// Grow by `delta` elements filled with `init`. Returns the previous size
    /// or `None` when the declared maximum would be exceeded (the caller
    /// surfaces `-1`).
    pub fn grow(&self, delta: u32, init: Ref) -> Option<u32> {
        let mut elems = self.elems.write().expect("table lock");
        let prev = elems.len() as u32;
        let new = prev.checked_add(delta)?;
        if let Some(max) = self.ty.limits.max {
            if new > max {
                return None;
            }
        }
        elems.resize(new as usize, init);
        Some(prev)
    }

    /// `table.fill`.
    pub fn fill(&self, dst: u32, val: Ref, len: u32) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("table lock");
        let start = dst as usize;
        let end = start.checked_add(len as usize).ok_or(Trap::OutOfBounds)?;
        if end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        elems[start..end].fill(val);
        Ok(())
    }

    /// `table.init`: copy a slice of element items in.
    pub fn init_from(&self, dst: u32, items: &[Ref], src: u32, len: u32) -> Result<(), Trap> {
        let s = src as usize;
        let n = len as usize;
        let s_end = s.checked_add(n).ok_or(Trap::OutOfBounds)?;
        if s_end > items.len() {
            return Err(Trap::OutOfBounds);
        }
        let mut elems = self.elems.write().expect("table lock");
        let d = dst as usize;
        let d_end = d.checked_add(n).ok_or(Trap::OutOfBounds)?;
        if d_end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        elems[d..d_end].clone_from_slice(&items[s..s_end]);
        Ok(())
    }

    /// `table.copy` within one table; overlapping ranges are handled.
    pub fn copy_within(&self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let mut elems = self.elems.write().expect("table lock");
        let n = len as usize;
        let d = dst as usize;
        let s = src as usize;
        if d.checked_add(n).map_or(true, |e| e > elems.len())
            || s.checked_add(n).map_or(true, |e| e > elems.len())
        {
            return Err(Trap::OutOfBounds);
        }
        if d <= s {
            for i in 0..n {
                elems[d + i] = elems[s + i].clone();
            }
        } else {
            for i in (0..n).rev() {
                elems[d + i] = elems[s + i].clone();
            }
        }
        Ok(())
    }

    /// `table.copy` across two tables.
    pub fn copy_from(&self, dst: u32, src_table: &TableInstance, src: u32, len: u32) -> Result<(), Trap> {
        if std::ptr::eq(self, src_table) {
            return self.copy_within(dst, src, len);
        }
        let src_elems = src_table.elems.read().expect("table lock");
        let s = src as usize;
        let n = len as usize;
        let s_end = s.checked_add(n).ok_or(Trap::OutOfBounds)?;
        if s_end > src_elems.len() {
            return Err(Trap::OutOfBounds);
        }
        let mut elems = self.elems.write().expect("table lock");
        let d = dst as usize;
        let d_end = d.checked_add(n).ok_or(Trap::OutOfBounds)?;
        if d_end > elems.len() {
            return Err(Trap::OutOfBounds);
        }
        elems[d..d_end].clone_from_slice(&src_elems[s..s_end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{HeapType, Limits, RefType};
    use crate::runtime::FuncAddr;

    fn funcref_table(min: u32, max: Option<u32>) -> TableInstance {
        let ty = TableType { elem: RefType::FUNCREF, limits: Limits::new(min, max) };
        TableInstance::new(ty, Ref::Null(HeapType::NoFunc))
    }

    #[test]
    fn get_set_bounds() {
        let t = funcref_table(2, Some(4));
        assert!(t.get(1).unwrap().is_null());
        t.set(1, Ref::Func(FuncAddr(7))).unwrap();
        assert_eq!(t.get(1).unwrap(), Ref::Func(FuncAddr(7)));
        assert!(t.get(2).is_err());
        assert!(t.set(2, Ref::Null(HeapType::NoFunc)).is_err());
    }

    #[test]
    fn grow_respects_max() {
        let t = funcref_table(1, Some(2));
        assert_eq!(t.grow(1, Ref::Null(HeapType::NoFunc)), Some(1));
        assert_eq!(t.grow(1, Ref::Null(HeapType::NoFunc)), None);
    }

    #[test]
    fn overlapping_copy() {
        let t = funcref_table(4, None);
        t.set(0, Ref::Func(FuncAddr(0))).unwrap();
        t.set(1, Ref::Func(FuncAddr(1))).unwrap();
        t.copy_within(1, 0, 2).unwrap();
        assert_eq!(t.get(1).unwrap(), Ref::Func(FuncAddr(0)));
        assert_eq!(t.get(2).unwrap(), Ref::Func(FuncAddr(1)));
    }
}
