/// Adler32-style rolling hash for block matching.
///
/// Uses two 16-bit sums (a, b) combined into a 32-bit hash.
/// Supports O(1) sliding window updates: remove oldest byte, add new byte,
/// and O(1) shrinking when the window runs into the end of an entry.
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingHash {
    pub fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window_size: 0,
        }
    }

    /// Hash of `data` in one shot.
    pub fn checksum(data: &[u8]) -> u32 {
        let mut h = Self::new();
        h.init(data);
        h.digest()
    }

    /// Compute hash over an initial block of data.
    pub fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u32;
        // Accumulate in u64 to defer all modular reductions to a single pair of operations
        // at the end, rather than reducing on every byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in data {
            a += byte as u64;
            b += a;
        }
        self.a = (a % MOD_ADLER as u64) as u32;
        self.b = (b % MOD_ADLER as u64) as u32;
    }

    /// Slide the window: remove `old_byte` from front, add `new_byte` at back.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a
            - (old * self.window_size) % MOD_ADLER)
            % MOD_ADLER;
    }

    /// Shrink the window: remove `old_byte` from front without adding anything.
    pub fn roll_out(&mut self, old_byte: u8) {
        let old = old_byte as u32;

        self.a = (self.a + MOD_ADLER - old) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 - (old * self.window_size) % MOD_ADLER) % MOD_ADLER;
        self.window_size -= 1;
    }

    pub fn window_size(&self) -> usize {
        self.window_size as usize
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
