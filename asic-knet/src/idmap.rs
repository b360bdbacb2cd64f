// Lowest-free id allocation for the control-plane tables

#[derive(Debug, Clone)]
pub(crate) struct IdBitmap {
    words: Vec<u64>,
    max: u32,
}

impl IdBitmap {
    pub fn new(max: u32) -> Self {
        Self {
            words: vec![0; (max as usize).div_ceil(64)],
            max,
        }
    }

    /// Take the lowest free id.
    pub fn alloc(&mut self) -> Option<u32> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = w as u32 * 64 + bit;
            if id >= self.max {
                return None;
            }
            *word |= 1 << bit;
            return Some(id);
        }
        None
    }

    pub fn release(&mut self, id: u32) {
        if id < self.max {
            self.words[id as usize / 64] &= !(1 << (id % 64));
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: u32) -> bool {
        id < self.max && self.words[id as usize / 64] & (1 << (id % 64)) != 0
    }
}
