/// A wrapping sequence generator over a configurable bit width.
///
/// A 2 bit sequencer produces `0, 1, 2, 3, 0, 1, 2, 3, ...`. The
/// [`distance`](Sequencer::distance) function treats the sequence space as
/// circular, so comparisons stay correct across the wrap point as long as
/// the two values are within half the space of each other.
#[derive(Debug, Clone)]
pub struct Sequencer {
    bits: u8,
    mask: u64,
    shift: u32,
    sequence: u64,
}

impl Sequencer {
    /// Creates a sequencer over `bits` bits (1 to 16, sequences are u16 on
    /// the wire).
    pub fn new(bits: u8) -> Self {
        debug_assert!(bits >= 1 && bits <= 16, "sequence bits out of range");
        Self {
            bits,
            mask: (1u64 << bits) - 1,
            shift: u64::BITS - u32::from(bits),
            sequence: 0,
        }
    }

    /// Bit width of this sequencer.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Number of distinct sequence values.
    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Returns the current value and advances, wrapping at the top of the
    /// space. The first call returns 0.
    pub fn next(&mut self) -> u64 {
        let current = self.sequence;
        self.sequence = self.next_after(self.sequence);
        current
    }

    /// The value following `sequence`, wrapping if necessary.
    pub fn next_after(&self, sequence: u64) -> u64 {
        (sequence + 1) & self.mask
    }

    /// Clamps an arbitrary value into the sequence space.
    pub fn move_in_bounds(&self, sequence: u64) -> u64 {
        sequence & self.mask
    }

    /// `from - to` adjusted for wraparound. Positive when `from` is ahead
    /// of `to`, negative when behind.
    pub fn distance(&self, from: u64, to: u64) -> i64 {
        let from = from << self.shift;
        let to = to << self.shift;
        (from.wrapping_sub(to) as i64) >> self.shift
    }
}
