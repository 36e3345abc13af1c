use crate::sequencer::Sequencer;

/// A ring of `1 << bits` slots addressed by sequence number.
///
/// Supports both queue-style use (`enqueue`/`try_dequeue` walking the read
/// and write pointers) and random insertion at a sequence index for
/// out-of-order arrival, which is how the reliability engine stores
/// received packets until they can be released in order.
pub struct RingBuffer<T> {
    sequencer: Sequencer,
    buffer: Vec<Option<T>>,
    /// Oldest item.
    read: u64,
    /// Next slot to be written by `enqueue`.
    write: u64,
    /// Number of occupied slots; differs from the read..write span when
    /// items are inserted or removed out of order.
    count: usize,
}

impl<T> RingBuffer<T> {
    /// Creates a ring with `1 << bits` slots.
    pub fn new(bits: u8) -> Self {
        let capacity = 1usize << bits;
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || None);
        Self { sequencer: Sequencer::new(bits), buffer, read: 0, write: 0, count: 0 }
    }

    /// The sequencer sizing this ring.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Current read index (oldest outstanding sequence).
    pub fn read_index(&self) -> u64 {
        self.read
    }

    /// Current write index (next sequence `enqueue` will use).
    pub fn write_index(&self) -> u64 {
        self.write
    }

    /// True when the write pointer has caught up behind the read pointer.
    pub fn is_full(&self) -> bool {
        self.sequencer.distance(self.write, self.read) == -1
    }

    /// Signed distance from `from` to the read pointer.
    pub fn distance_to_read(&self, from: u64) -> i64 {
        self.sequencer.distance(from, self.read)
    }

    /// Writes `item` at the write pointer and advances it. Returns the
    /// sequence the item was stored under, or `None` when the ring is full.
    pub fn enqueue(&mut self, item: T) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        let sequence = self.write;
        self.buffer[sequence as usize] = Some(item);
        self.write = self.sequencer.next_after(self.write);
        self.count += 1;
        Some(sequence)
    }

    /// Removes and returns the item at the read pointer, advancing it.
    /// Returns `None` when the slot at the read pointer is empty.
    pub fn try_dequeue(&mut self) -> Option<T> {
        let item = self.buffer[self.read as usize].take()?;
        self.read = self.sequencer.next_after(self.read);
        self.count -= 1;
        Some(item)
    }

    /// The item at the read pointer, if present.
    pub fn try_peek(&self) -> Option<&T> {
        self.buffer[self.read as usize].as_ref()
    }

    /// Whether the slot at `index` is occupied.
    pub fn exists(&self, index: u64) -> bool {
        self.buffer[self.sequencer.move_in_bounds(index) as usize].is_some()
    }

    /// The item at `index`, if present.
    pub fn get(&self, index: u64) -> Option<&T> {
        self.buffer[self.sequencer.move_in_bounds(index) as usize].as_ref()
    }

    /// Stores `item` at an arbitrary sequence index without touching the
    /// read or write pointers. Replacing an occupied slot returns the old
    /// item without changing the count.
    pub fn insert_at(&mut self, index: u64, item: T) -> Option<T> {
        let slot = &mut self.buffer[self.sequencer.move_in_bounds(index) as usize];
        let previous = slot.replace(item);
        if previous.is_none() {
            self.count += 1;
        }
        previous
    }

    /// Clears the slot at `index`, returning its item.
    pub fn remove_at(&mut self, index: u64) -> Option<T> {
        let item = self.buffer[self.sequencer.move_in_bounds(index) as usize].take();
        if item.is_some() {
            self.count -= 1;
        }
        item
    }

    /// Advances the read pointer past slots emptied by out-of-order
    /// removal, stopping at the first occupied slot or the write pointer.
    pub fn move_read_to_next_non_empty(&mut self) {
        while self.read != self.write && self.buffer[self.read as usize].is_none() {
            self.read = self.sequencer.next_after(self.read);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_dequeue_in_order() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(4);
        assert_eq!(ring.enqueue(10), Some(0));
        assert_eq!(ring.enqueue(20), Some(1));
        assert_eq!(ring.count(), 2);

        assert_eq!(ring.try_dequeue(), Some(10));
        assert_eq!(ring.try_dequeue(), Some(20));
        assert_eq!(ring.try_dequeue(), None);
        assert_eq!(ring.count(), 0);
    }

    #[test]
    fn test_full_detection() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(2);
        // a ring of 4 slots holds 3 items before write catches read
        assert!(ring.enqueue(1).is_some());
        assert!(ring.enqueue(2).is_some());
        assert!(ring.enqueue(3).is_some());
        assert!(ring.is_full());
        assert_eq!(ring.enqueue(4), None);

        ring.try_dequeue();
        assert!(!ring.is_full());
        assert!(ring.enqueue(4).is_some());
    }

    #[test]
    fn test_insert_out_of_order_then_peek() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(4);
        ring.insert_at(2, 30);
        // read pointer still at 0, nothing in order yet
        assert_eq!(ring.try_peek(), None);
        assert!(ring.exists(2));

        ring.insert_at(0, 10);
        assert_eq!(ring.try_peek(), Some(&10));
        assert_eq!(ring.try_dequeue(), Some(10));
        // slot 1 missing blocks slot 2
        assert_eq!(ring.try_dequeue(), None);

        ring.insert_at(1, 20);
        assert_eq!(ring.try_dequeue(), Some(20));
        assert_eq!(ring.try_dequeue(), Some(30));
    }

    #[test]
    fn test_duplicate_insert_reports_previous() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(4);
        assert_eq!(ring.insert_at(3, 1), None);
        assert_eq!(ring.insert_at(3, 2), Some(1));
        assert_eq!(ring.count(), 1);
    }

    #[test]
    fn test_move_read_skips_removed() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(4);
        for i in 0..4 {
            ring.enqueue(i);
        }
        ring.remove_at(0);
        ring.remove_at(1);
        ring.move_read_to_next_non_empty();
        assert_eq!(ring.read_index(), 2);
        assert_eq!(ring.try_dequeue(), Some(2));
    }

    #[test]
    fn test_wraps_around() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(2);
        for round in 0..10u32 {
            assert!(ring.enqueue(round).is_some());
            assert_eq!(ring.try_dequeue(), Some(round));
        }
        // pointers wrapped several times without corruption
        assert_eq!(ring.count(), 0);
    }

    #[test]
    fn test_distance_to_read() {
        let mut ring: RingBuffer<u32> = RingBuffer::new(4);
        ring.enqueue(1);
        ring.enqueue(2);
        ring.try_dequeue();
        assert_eq!(ring.distance_to_read(1), 0);
        assert_eq!(ring.distance_to_read(5), 4);
        assert_eq!(ring.distance_to_read(0), -1);
    }
}
