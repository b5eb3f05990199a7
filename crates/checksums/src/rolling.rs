//! Rolling weak checksum (often called `rsum`).
//!
//! Mirrors rsync's Adler-32 style weak checksum: `s1` accumulates the byte
//! sum, `s2` accumulates prefix sums, both truncated to 16 bits. The packed
//! 32-bit value is `(s2 << 16) | s1`. The checksum supports O(1) window
//! updates, which is what makes the sliding-window block search affordable.

/// Errors raised by window operations on an inconsistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RollingError {
    /// A roll or trim was attempted on an empty window.
    #[error("rolling checksum window is empty")]
    EmptyWindow,

    /// The window grew past what the 32-bit arithmetic can weight.
    #[error("rolling checksum window of {len} bytes is too large")]
    WindowTooLarge {
        /// Offending window length.
        len: usize,
    },
}

/// Rolling weak checksum over a byte window.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Creates a checksum with an empty window.
    #[must_use]
    pub const fn new() -> Self {
        Self { s1: 0, s2: 0, len: 0 }
    }

    /// Computes the checksum of one complete block.
    #[must_use]
    pub fn from_block(block: &[u8]) -> Self {
        let mut checksum = Self::new();
        checksum.update(block);
        checksum
    }

    /// Resets the window to empty.
    pub fn reset(&mut self) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = 0;
    }

    /// Number of bytes currently in the window.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes have been observed.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extends the window with a slice of bytes.
    #[inline]
    pub fn update(&mut self, chunk: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;

        let mut iter = chunk.chunks_exact(4);
        for block in &mut iter {
            s1 = s1.wrapping_add(u32::from(block[0]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[1]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[2]));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(block[3]));
            s2 = s2.wrapping_add(s1);
        }
        for &byte in iter.remainder() {
            s1 = s1.wrapping_add(u32::from(byte));
            s2 = s2.wrapping_add(s1);
        }

        self.s1 = s1 & 0xffff;
        self.s2 = s2 & 0xffff;
        self.len += chunk.len();
    }

    /// Appends one byte to the window.
    #[inline]
    pub fn add(&mut self, byte: u8) {
        self.update(&[byte]);
    }

    /// Removes the leading byte from the window, shrinking it by one.
    ///
    /// Used at the tail of a file where the window drains without refilling.
    ///
    /// # Errors
    ///
    /// [`RollingError::EmptyWindow`] if no bytes are buffered.
    #[inline]
    pub fn trim_front(&mut self, outgoing: u8) -> Result<(), RollingError> {
        let window_len = self.window_len_u32()?;
        let out = u32::from(outgoing);

        self.s1 = self.s1.wrapping_sub(out) & 0xffff;
        self.s2 = self.s2.wrapping_sub(window_len.wrapping_mul(out)) & 0xffff;
        self.len -= 1;
        Ok(())
    }

    /// Rolls the window one position: removes `outgoing`, appends
    /// `incoming`. The window length stays constant.
    ///
    /// # Errors
    ///
    /// [`RollingError::EmptyWindow`] if no bytes are buffered.
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) -> Result<(), RollingError> {
        let window_len = self.window_len_u32()?;

        let out = u32::from(outgoing);
        let inn = u32::from(incoming);

        let new_s1 = self.s1.wrapping_sub(out).wrapping_add(inn) & 0xffff;
        let new_s2 = self
            .s2
            .wrapping_sub(window_len.wrapping_mul(out))
            .wrapping_add(new_s1)
            & 0xffff;

        self.s1 = new_s1;
        self.s2 = new_s2;
        Ok(())
    }

    /// Packed 32-bit value in rsync's wire representation.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        (self.s2 << 16) | (self.s1 & 0xffff)
    }

    #[inline]
    fn window_len_u32(&self) -> Result<u32, RollingError> {
        if self.len == 0 {
            return Err(RollingError::EmptyWindow);
        }
        u32::try_from(self.len).map_err(|_| RollingError::WindowTooLarge { len: self.len })
    }
}
