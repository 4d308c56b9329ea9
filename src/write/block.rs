//! Write-side blocks.
//!
//! A [`WriteBlock`] is a pool buffer being filled sequentially with kernel
//! write data. Its absolute stream offset is bound once, when the first
//! byte lands; rebinding is rejected. Ownership moves writer → upload
//! channel → uploader, and dropping the block anywhere on that path
//! returns its buffer to the pool.

use blobfs_pool::{PoolBlock, PooledBuf};

/// One block of the upload stream.
#[derive(Debug)]
pub(crate) struct WriteBlock {
    buf: PooledBuf,
    abs_start_off: Option<u64>,
}

impl PoolBlock for WriteBlock {
    fn from_buf(buf: PooledBuf) -> Self {
        Self {
            buf,
            abs_start_off: None,
        }
    }
}

impl WriteBlock {
    /// Bind the block to its absolute offset in the upload stream.
    /// Write-once: returns `false` if the block is already bound.
    pub(crate) fn bind_start(&mut self, off: u64) -> bool {
        if self.abs_start_off.is_some() {
            return false;
        }
        self.abs_start_off = Some(off);
        true
    }

    /// Absolute stream offset of the first byte, once bound.
    pub(crate) fn abs_start_off(&self) -> Option<u64> {
        self.abs_start_off
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub(crate) fn append(&mut self, src: &[u8]) -> usize {
        self.buf.append(src)
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.is_full()
    }

    /// The bytes to upload, from the start of the block.
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobfs_pool::{BlockPool, GlobalBudget};

    fn block() -> WriteBlock {
        let pool: BlockPool<WriteBlock> =
            BlockPool::new(8, 1, 1, 1, GlobalBudget::new(1)).unwrap();
        pool.try_get().unwrap()
    }

    #[test]
    fn start_offset_binds_once() {
        let mut block = block();
        assert!(block.bind_start(64));
        assert!(!block.bind_start(128));
        assert_eq!(block.abs_start_off(), Some(64));
    }

    #[test]
    fn append_fills_to_capacity() {
        let mut block = block();
        assert_eq!(block.append(b"abcdef"), 6);
        assert!(!block.is_full());
        assert_eq!(block.append(b"ghij"), 2);
        assert!(block.is_full());
        assert_eq!(block.as_slice(), b"abcdefgh");
    }
}
