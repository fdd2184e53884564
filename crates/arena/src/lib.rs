use std::cell::Cell;
use std::io;
use std::ptr::NonNull;

// Both arena flavors are built on a single bump-allocator implementation.
// Re-export the concrete type for callers that want to size chunks directly.
pub use bumpalo::Bump;

/// Arena is the engine-tied allocation region used for transient parse
/// state and AST storage. Allocations are bump-pointer cheap, aligned to
/// their type, and live until the arena is reset or dropped. `reset`
/// rewinds the region in O(1) while retaining its chunks for reuse.
pub struct Arena {
    bump: Bump,
    allocations: Cell<usize>,
    requested: Cell<usize>,
}

/// Counters describing an Arena's usage since creation or the last `reset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of individual allocations served.
    pub allocations: usize,
    /// Total bytes requested by those allocations (not counting padding).
    pub requested: usize,
    /// Bytes of chunk capacity currently held from the process allocator.
    pub capacity: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            bump: Bump::new(),
            allocations: Cell::new(0),
            requested: Cell::new(0),
        }
    }

    /// Build an Arena which pre-allocates `capacity` bytes.
    /// Requests larger than the chunk in hand get a dedicated chunk
    /// sized to the request.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bump: Bump::with_capacity(capacity),
            allocations: Cell::new(0),
            requested: Cell::new(0),
        }
    }

    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bookkeep(std::mem::size_of::<T>());
        self.bump.alloc(value)
    }

    /// Copy `s` into the arena. The returned str is owned by the arena and
    /// valid until the next `reset`, which is what lets AST nodes hold
    /// plain `&str` payloads with no tie back to engine-interned storage.
    pub fn alloc_str<'a>(&'a self, s: &str) -> &'a str {
        self.bookkeep(s.len());
        self.bump.alloc_str(s)
    }

    pub fn alloc_slice_copy<'a, T: Copy>(&'a self, src: &[T]) -> &'a mut [T] {
        self.bookkeep(std::mem::size_of_val(src));
        self.bump.alloc_slice_copy(src)
    }

    /// Rewind the arena, invalidating all outstanding allocations (the
    /// borrow checker enforces this: `reset` requires exclusive access).
    /// Chunk storage is retained for reuse.
    pub fn reset(&mut self) {
        self.bump.reset();
        self.allocations.set(0);
        self.requested.set(0);
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocations: self.allocations.get(),
            requested: self.requested.get(),
            capacity: self.bump.allocated_bytes(),
        }
    }

    fn bookkeep(&self, size: usize) {
        self.allocations.set(self.allocations.get() + 1);
        self.requested.set(self.requested.get() + size);
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// TransferBuf is a byte payload coupled with the standalone arena that owns
/// its storage. It exists to carry serialized messages between worker
/// threads: the producer thread fills it, ownership moves through a queue,
/// and the consumer thread reads and then drops it, freeing the arena —
/// without ever calling back into the producer's allocator.
pub struct TransferBuf {
    ptr: NonNull<u8>,
    len: usize,
    // Owns the chunk `ptr` points into. Chunks are heap allocations with
    // stable addresses, so moving the TransferBuf does not move the bytes.
    bump: Bump,
}

// Safety: TransferBuf exclusively owns both the Bump and the region `ptr`
// addresses within it; Bump itself is Send.
unsafe impl Send for TransferBuf {}

impl TransferBuf {
    /// Copy `bytes` into a fresh standalone arena.
    pub fn copy_from(bytes: &[u8]) -> Self {
        let bump = Bump::with_capacity(bytes.len());
        let slice = bump.alloc_slice_copy(bytes);
        let ptr = NonNull::new(slice.as_mut_ptr()).expect("bump allocation is non-null");
        let len = slice.len();
        Self { ptr, len, bump }
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len denote the live allocation made in `bump`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for TransferBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBuf")
            .field("len", &self.len)
            .finish()
    }
}

/// TransferWriter accumulates bytes inside a standalone arena, doubling its
/// buffer as it grows. Superseded buffers are simply orphaned within the
/// arena and released when the arena is. `finish` converts the writer into
/// the TransferBuf that carries the final payload.
pub struct TransferWriter {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
    bump: Bump,
}

// Safety: as with TransferBuf, the writer exclusively owns its arena and
// the region within it.
unsafe impl Send for TransferWriter {}

const INITIAL_BUF: usize = 64;

impl TransferWriter {
    pub fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
            bump: Bump::new(),
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.len + bytes.len() > self.cap {
            self.grow(bytes.len());
        }
        // Safety: grow guarantees capacity; regions cannot overlap because
        // `bytes` is borrowed and the buffer is exclusively ours.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
    }

    pub fn push(&mut self, byte: u8) {
        self.extend_from_slice(&[byte]);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn finish(self) -> TransferBuf {
        let Self {
            ptr, len, bump, ..
        } = self;
        TransferBuf { ptr, len, bump }
    }

    fn grow(&mut self, additional: usize) {
        let new_cap = std::cmp::max(
            std::cmp::max(self.cap * 2, INITIAL_BUF),
            self.len + additional,
        );
        let new = self.bump.alloc_slice_fill_default::<u8>(new_cap);
        if self.len != 0 {
            // Safety: old and new regions are distinct allocations.
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new.as_mut_ptr(), self.len);
            }
        }
        self.ptr = NonNull::new(new.as_mut_ptr()).expect("bump allocation is non-null");
        self.cap = new_cap;
        // The previous buffer stays behind in the arena until it is freed.
    }
}

impl Default for TransferWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for TransferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn alloc_is_aligned_and_stable() {
        let arena = Arena::new();
        let a = arena.alloc(1u64) as *const u64;
        let b = arena.alloc(2u64) as *const u64;
        assert_eq!(a.align_offset(std::mem::align_of::<u64>()), 0);
        assert_eq!(b.align_offset(std::mem::align_of::<u64>()), 0);
        assert_ne!(a, b);

        let s = arena.alloc_str("hello");
        assert_eq!(s, "hello");

        let stats = arena.stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.requested, 8 + 8 + 5);
    }

    #[test]
    fn reset_retains_capacity() {
        let mut arena = Arena::with_capacity(4096);
        for i in 0..512u32 {
            arena.alloc(i);
        }
        let before = arena.stats().capacity;
        assert!(before >= 2048);

        arena.reset();
        let after = arena.stats();
        assert_eq!(after.allocations, 0);
        assert_eq!(after.requested, 0);
        assert!(after.capacity >= 2048, "reset must not shed chunk storage");
    }

    #[test]
    fn oversize_allocation_gets_dedicated_storage() {
        let arena = Arena::with_capacity(64);
        let big = arena.alloc_slice_copy(&[7u8; 100_000]);
        assert_eq!(big.len(), 100_000);
        assert!(big.iter().all(|&b| b == 7));
    }

    #[test]
    fn transfer_buf_crosses_threads() {
        let buf = TransferBuf::copy_from(b"cross-thread payload");
        let handle = std::thread::spawn(move || {
            assert_eq!(buf.as_slice(), b"cross-thread payload");
            drop(buf); // freed on the consumer thread
        });
        handle.join().unwrap();
    }

    #[test]
    fn writer_grows_by_doubling() {
        let mut w = TransferWriter::new();
        for chunk in 0..100u8 {
            w.write_all(&[chunk; 33]).unwrap();
        }
        assert_eq!(w.len(), 3300);

        let buf = w.finish();
        assert_eq!(buf.len(), 3300);
        assert_eq!(&buf.as_slice()[..33], &[0u8; 33]);
        assert_eq!(&buf.as_slice()[3267..], &[99u8; 33]);
    }

    #[test]
    fn empty_writer_finishes_empty() {
        let buf = TransferWriter::new().finish();
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), b"");
    }
}
