use std::ops::Range;

use crate::Pool;

slotmap::new_key_type! {
    /// Handle of a [`StackBlock`] inside a [`StackPool`].
    pub struct StackKey;
}

/// Alignment of every stack block, and the granularity slices are carved at.
pub const STACK_ALIGN: usize = std::mem::align_of::<u64>();

/// A zero-initialized block of raw bytes holding the persistent locals of
/// one task. The block is backed by `u64` words so any slice starting at a
/// multiple of [`STACK_ALIGN`] can be viewed as a `Pod` value of at most that
/// alignment.
pub struct StackBlock {
    words: Box<[u64]>,
}

impl StackBlock {
    /// Create a zeroed block of at least `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        let words = (size + STACK_ALIGN - 1) / STACK_ALIGN;
        StackBlock {
            words: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Size of this block in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * STACK_ALIGN
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Zero the bytes in `range`.
    pub fn zero(&mut self, range: Range<usize>) {
        self.bytes_mut()[range].fill(0);
    }
}

impl std::fmt::Debug for StackBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBlock").field("len", &self.len()).finish()
    }
}

/// Pool of equally sized stack blocks.
///
/// Freed blocks are zeroed and kept on a spare list, so steady-state task
/// churn does not go back to the system allocator.
pub struct StackPool {
    /// Already rounded up to [`STACK_ALIGN`].
    block_size: usize,
    blocks: Pool<StackKey, StackBlock>,
    spare: Vec<StackBlock>,
}

impl StackPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        assert!(block_size > 0, "stack blocks must not be empty");
        StackPool {
            block_size: (block_size + STACK_ALIGN - 1) / STACK_ALIGN * STACK_ALIGN,
            blocks: Pool::with_capacity("stack", capacity),
            spare: Vec::new(),
        }
    }

    /// Size in bytes of every block handed out by this pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hand out a zeroed block.
    pub fn alloc(&mut self) -> StackKey {
        let block = self
            .spare
            .pop()
            .unwrap_or_else(|| StackBlock::zeroed(self.block_size));
        self.blocks.alloc(block)
    }

    /// Return a block to the pool. Returns `false` if `key` was already freed.
    pub fn free(&mut self, key: StackKey) -> bool {
        match self.blocks.free(key) {
            Some(mut block) => {
                let len = block.len();
                block.zero(0..len);
                if self.spare.len() < self.blocks.capacity() {
                    self.spare.push(block);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every live block.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn get(&self, key: StackKey) -> Option<&StackBlock> {
        self.blocks.get(key)
    }

    pub fn get_mut(&mut self, key: StackKey) -> Option<&mut StackBlock> {
        self.blocks.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl std::ops::Index<StackKey> for StackPool {
    type Output = StackBlock;

    fn index(&self, key: StackKey) -> &StackBlock {
        &self.blocks[key]
    }
}

impl std::ops::IndexMut<StackKey> for StackPool {
    fn index_mut(&mut self, key: StackKey) -> &mut StackBlock {
        &mut self.blocks[key]
    }
}
