//! Fixed-capacity byte ring buffer.

/// FIFO of bytes over a fixed allocation.
///
/// `head` is the index of the oldest byte; the `len` bytes after it (mod
/// capacity) are readable.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0; capacity.max(1)].into_boxed_slice(), head: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append as much of `data` as fits; returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.len += n;
        n
    }

    /// Move up to `out.len()` bytes into `out`; returns the number moved.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn wraps_around_the_end() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.write(b"abc"), 3);
        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(&out, b"ab");

        // Two bytes land at the end, one wraps to the front.
        assert_eq!(ring.write(b"def"), 3);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(b"g"), 0);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out[..4], b"cdef");
        assert!(ring.is_empty());
    }

    #[test]
    fn reset_discards_content() {
        let mut ring = RingBuffer::new(8);
        ring.write(b"hello");
        ring.reset();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.free(), 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => prop::collection::vec(any::<u8>(), 0..40).prop_map(Op::Write),
            4 => (0usize..40).prop_map(Op::Read),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_bounded_deque(capacity in 1usize..32, ops in prop::collection::vec(op(), 0..64)) {
            let mut ring = RingBuffer::new(capacity);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(data) => {
                        let taken = ring.write(&data);
                        let expected = data.len().min(capacity - model.len());
                        prop_assert_eq!(taken, expected);
                        model.extend(&data[..taken]);
                    }
                    Op::Read(n) => {
                        let mut out = vec![0u8; n];
                        let got = ring.read(&mut out);
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        prop_assert_eq!(&out[..got], &expected[..]);
                    }
                    Op::Reset => {
                        ring.reset();
                        model.clear();
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
                prop_assert_eq!(ring.free(), capacity - model.len());
            }
        }
    }
}
