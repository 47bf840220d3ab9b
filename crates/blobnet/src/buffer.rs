use crate::{Error, Result};

/// A contiguous byte region with explicit size and capacity.
///
/// Buffers are either growable (backed by storage this buffer owns and may
/// reallocate) or fixed (caller-supplied storage whose capacity is final).
/// Receive paths write past `size` into spare capacity and commit afterwards,
/// so storage is always zero-initialized up to `capacity`.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    size: usize,
    fixed: bool,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            data: vec![0; capacity],
            size: 0,
            fixed: false,
        }
    }

    /// An owned buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        ByteBuffer {
            data: bytes.to_vec(),
            size: bytes.len(),
            fixed: false,
        }
    }

    /// Wrap caller-supplied storage. The capacity is final: any `reserve`
    /// past it fails, so the engine never reallocates behind the caller.
    pub fn fixed(storage: Vec<u8>) -> Self {
        ByteBuffer {
            size: 0,
            fixed: true,
            data: storage,
        }
    }

    /// Used bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether this buffer may grow and hand out its storage.
    pub fn owned(&self) -> bool {
        !self.fixed
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Raw pointer to the byte at `offset`, valid for `size - offset` bytes.
    /// The pointer stays valid until the next `reserve`/`resize` growth.
    pub fn as_mut_ptr_at(&mut self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        self.data[offset..].as_mut_ptr()
    }

    /// Drop the content, keep the storage.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Grow capacity to at least `capacity`; existing bytes survive.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.data.len() {
            return Ok(());
        }
        if self.fixed {
            return Err(Error::BufferFixed {
                capacity: self.data.len(),
            });
        }
        self.data.resize(capacity, 0);
        Ok(())
    }

    /// Set the used size, growing capacity when needed.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        if size > self.data.len() {
            self.reserve(size)?;
        }
        self.size = size;
        Ok(())
    }

    /// Append a copy of `bytes`.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let at = self.size;
        self.resize(at + bytes.len())?;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Transfer the storage out of an owned buffer, leaving it empty.
    /// Fixed buffers also give up their storage: it returns to the caller
    /// that supplied it.
    pub fn take_owned(&mut self) -> Vec<u8> {
        self.size = 0;
        self.fixed = false;
        std::mem::take(&mut self.data)
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        let size = data.len();
        ByteBuffer {
            data,
            size,
            fixed: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grow_and_shrink() {
        let mut buf = ByteBuffer::with_capacity(8);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.size(), 0);

        buf.extend_from_slice(b"hello world").unwrap();
        assert_eq!(buf.data(), b"hello world");
        assert!(buf.capacity() >= 11);

        let cap = buf.capacity();
        buf.resize(4).unwrap();
        assert_eq!(buf.data(), b"hell");
        assert_eq!(buf.capacity(), cap, "shrink keeps capacity");

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn reserve_keeps_content() {
        let mut buf = ByteBuffer::from_slice(b"abc");
        buf.reserve(1024).unwrap();
        assert_eq!(buf.data(), b"abc");
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn fixed_buffer_refuses_growth() {
        let mut buf = ByteBuffer::fixed(vec![0; 16]);
        assert!(!buf.owned());
        buf.resize(16).unwrap();
        match buf.resize(17) {
            Err(Error::BufferFixed { capacity: 16 }) => (),
            other => panic!("expected BufferFixed, got {other:?}"),
        }
    }

    #[test]
    fn take_owned_moves_storage() {
        let mut buf = ByteBuffer::from_slice(b"payload");
        let storage = buf.take_owned();
        assert_eq!(&storage[..7], b"payload");
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), 0);
    }
}
