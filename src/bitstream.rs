use crate::chunks::AlphaChannel;

/// Sequential bit reader over an alpha channel in column-major order.
///
/// Pixels are visited with `x` as the outer loop and `y` as the inner loop;
/// each pixel contributes the least-significant bit of its value. Bytes are
/// assembled most-significant bit first.
pub struct BitstreamReader<'a> {
    channel: &'a dyn AlphaChannel,
    width: u32,
    height: u32,
    x: u32,
    y: u32,
}

impl<'a> BitstreamReader<'a> {
    /// Start reading at pixel `(0, 0)`.
    pub fn new(channel: &'a dyn AlphaChannel) -> Self {
        Self {
            width: channel.width(),
            height: channel.height(),
            channel,
            x: 0,
            y: 0,
        }
    }

    /// Number of bits left before the channel is exhausted.
    pub fn remaining_bits(&self) -> u64 {
        if self.height == 0 || self.x >= self.width {
            return 0;
        }
        let consumed = u64::from(self.x) * u64::from(self.height) + u64::from(self.y);
        u64::from(self.width) * u64::from(self.height) - consumed
    }

    /// Next bit, or `None` once every pixel has been consumed.
    pub fn read_bit(&mut self) -> Option<u8> {
        if self.height == 0 || self.x >= self.width {
            return None;
        }
        let bit = self.channel.get(self.x, self.y) & 1;
        self.y += 1;
        if self.y >= self.height {
            self.y = 0;
            self.x += 1;
        }
        Some(bit)
    }

    /// Next byte, or `None` when fewer than 8 bits remain.
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.remaining_bits() < 8 {
            return None;
        }
        let mut value = 0u8;
        for _ in 0..8 {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    /// Exactly `count` bytes, or `None` when the channel is too short.
    ///
    /// The length check happens before any pixel is read, so a truncated
    /// stream never allocates the declared size.
    pub fn read_exact(&mut self, count: usize) -> Option<Vec<u8>> {
        let needed = (count as u64).checked_mul(8)?;
        if self.remaining_bits() < needed {
            return None;
        }
        let mut bytes = Vec::with_capacity(count);
        for _ in 0..count {
            bytes.push(self.read_byte()?);
        }
        Some(bytes)
    }

    /// Big-endian `u32` built from the next four bytes.
    pub fn read_u32_be(&mut self) -> Option<u32> {
        let bytes = self.read_exact(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::AlphaPlane;

    fn plane_from_bits(width: u32, height: u32, bits: &[u8]) -> AlphaPlane {
        let mut plane = AlphaPlane::opaque(width, height).unwrap();
        let mut idx = 0;
        for x in 0..width {
            for y in 0..height {
                let bit = bits.get(idx).copied().unwrap_or(1);
                plane.set(x, y, 0xFE | bit);
                idx += 1;
            }
        }
        plane
    }

    #[test]
    fn traverses_columns_before_rows() {
        // 2x3 plane: column 0 holds bits 1,0,1 and column 1 holds 0,1,1.
        let plane = plane_from_bits(2, 3, &[1, 0, 1, 0, 1, 1]);
        let mut reader = BitstreamReader::new(&plane);
        let bits: Vec<u8> = std::iter::from_fn(|| reader.read_bit()).collect();
        assert_eq!(bits, vec![1, 0, 1, 0, 1, 1]);
    }

    #[test]
    fn assembles_bytes_msb_first() {
        let bits = [0, 1, 0, 0, 0, 0, 0, 1];
        let plane = plane_from_bits(1, 8, &bits);
        let mut reader = BitstreamReader::new(&plane);
        assert_eq!(reader.read_byte(), Some(b'A'));
        assert_eq!(reader.read_byte(), None);
    }

    #[test]
    fn read_exact_fails_cleanly_when_truncated() {
        let plane = plane_from_bits(4, 4, &[]);
        let mut reader = BitstreamReader::new(&plane);
        assert_eq!(reader.read_exact(3), None);
        assert_eq!(reader.remaining_bits(), 16);
        assert_eq!(reader.read_exact(2), Some(vec![0xFF, 0xFF]));
        assert_eq!(reader.remaining_bits(), 0);
    }

    #[test]
    fn empty_plane_yields_nothing() {
        let plane = AlphaPlane::new(0, 0, Vec::new()).unwrap();
        let mut reader = BitstreamReader::new(&plane);
        assert_eq!(reader.read_bit(), None);
        assert_eq!(reader.read_u32_be(), None);
    }
}
