use crate::image::Ty;

/// Temporary-local allocator for the rewriters
///
/// Call sites borrow scratch locals to spill arguments into and return
/// them once the site is emitted. Released slots are reused for later
/// borrows of the same type, so the local table stays small.
pub struct LocalCache {
    locals: Vec<Ty>,
    free: Vec<u16>,
}

impl LocalCache {
    pub fn new(original: Vec<Ty>) -> LocalCache {
        LocalCache { locals: original, free: vec![] }
    }

    pub fn borrow(&mut self, ty: &Ty) -> u16 {
        if let Some(pos) = self.free.iter().position(|&i| &self.locals[i as usize] == ty) {
            return self.free.swap_remove(pos);
        }
        self.locals.push(ty.clone());
        (self.locals.len() - 1) as u16
    }

    pub fn release(&mut self, index: u16) {
        self.free.push(index);
    }

    pub fn ty(&self, index: u16) -> &Ty {
        &self.locals[index as usize]
    }

    pub fn into_locals(self) -> Vec<Ty> {
        self.locals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused_by_type() {
        let mut cache = LocalCache::new(vec![Ty::I32]);
        let a = cache.borrow(&Ty::I64);
        let b = cache.borrow(&Ty::I64);
        assert_eq!((a, b), (1, 2));
        cache.release(a);
        assert_eq!(cache.borrow(&Ty::I64), a);
        // Wrong type never reuses a free slot
        assert_eq!(cache.borrow(&Ty::Str), 3);
        let locals = cache.into_locals();
        assert_eq!(locals, vec![Ty::I32, Ty::I64, Ty::I64, Ty::Str]);
    }
}
