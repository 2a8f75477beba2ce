use std::fmt;

/// Unsigned 16.16 fixed point value, as used for plane source coordinates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(pub u32);

impl Fixed {
    /// Converts an integer into fixed point
    pub fn from_int(n: u16) -> Self {
        Fixed((n as u32) << 16)
    }

    /// Converts a floating point value, rounding to the nearest representable value
    #[inline]
    pub fn from_f64(n: f64) -> Self {
        Fixed(f64::round(n * (1 << 16) as f64) as u32)
    }

    /// Integer part
    pub fn trunc(self) -> u32 {
        self.0 >> 16
    }

    /// Fractional part in millionths
    pub fn frac_micros(self) -> u32 {
        // 1_000_000 / 65536 == 15625 / 1024
        ((self.0 & 0xffff) * 15625) >> 10
    }
}

impl From<u32> for Fixed {
    fn from(raw: u32) -> Self {
        Fixed(raw)
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.trunc(), self.frac_micros())
    }
}
