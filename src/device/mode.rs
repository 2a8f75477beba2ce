//! Display modes and their blob representation

use std::fmt;

use crate::error::Error;

/// Size of a mode record stored in a `MODE_ID` blob
pub const MODE_INFO_SIZE: usize = 68;

const MODE_NAME_LEN: usize = 32;

/// Timings of a display mode
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Pixel clock in kHz
    pub clock: u32,
    /// Horizontal active pixels
    pub hdisplay: u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end: u16,
    /// Horizontal total
    pub htotal: u16,
    /// Horizontal skew
    pub hskew: u16,
    /// Vertical active lines
    pub vdisplay: u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end: u16,
    /// Vertical total
    pub vtotal: u16,
    /// Vertical scan
    pub vscan: u16,
    /// Refresh rate in Hz
    pub vrefresh: u32,
    /// Mode flags
    pub flags: u32,
    /// Mode type
    pub type_: u32,
    name: [u8; MODE_NAME_LEN],
}

impl Default for Mode {
    fn default() -> Self {
        Mode {
            clock: 0,
            hdisplay: 0,
            hsync_start: 0,
            hsync_end: 0,
            htotal: 0,
            hskew: 0,
            vdisplay: 0,
            vsync_start: 0,
            vsync_end: 0,
            vtotal: 0,
            vscan: 0,
            vrefresh: 0,
            flags: 0,
            type_: 0,
            name: [0; MODE_NAME_LEN],
        }
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mode")
            .field("name", &self.name())
            .field("clock", &self.clock)
            .field("size", &self.size())
            .field("vrefresh", &self.vrefresh)
            .finish()
    }
}

impl Mode {
    /// Creates a mode from the horizontal and vertical timings.
    ///
    /// The name is generated as `<hdisplay>x<vdisplay>`.
    pub fn new(clock: u32, h: (u16, u16, u16, u16), v: (u16, u16, u16, u16), vrefresh: u32) -> Mode {
        let mut mode = Mode {
            clock,
            hdisplay: h.0,
            hsync_start: h.1,
            hsync_end: h.2,
            htotal: h.3,
            vdisplay: v.0,
            vsync_start: v.1,
            vsync_end: v.2,
            vtotal: v.3,
            vrefresh,
            ..Default::default()
        };
        mode.set_name(&format!("{}x{}", h.0, v.0));
        mode
    }

    /// Name of the mode
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(MODE_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Sets the name of the mode, truncated to 31 bytes
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; MODE_NAME_LEN];
        let mut len = name.len().min(MODE_NAME_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    /// Active area in pixels
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    /// Checks the timings for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.clock == 0 || self.clock > i32::MAX as u32 {
            return Err(Error::InvalidUsage("mode clock out of range"));
        }

        let horizontal = self.hdisplay <= self.hsync_start
            && self.hsync_start <= self.hsync_end
            && self.hsync_end <= self.htotal;
        let vertical = self.vdisplay <= self.vsync_start
            && self.vsync_start <= self.vsync_end
            && self.vsync_end <= self.vtotal;

        if !horizontal || !vertical || self.hdisplay == 0 || self.vdisplay == 0 {
            return Err(Error::InvalidUsage("mode timings inconsistent"));
        }

        Ok(())
    }

    /// Serializes the mode into a blob record
    pub fn to_bytes(&self) -> [u8; MODE_INFO_SIZE] {
        let mut bytes = [0u8; MODE_INFO_SIZE];
        let mut cursor = Cursor::new(&mut bytes);
        cursor.put(&self.clock.to_ne_bytes());
        for value in [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ] {
            cursor.put(&value.to_ne_bytes());
        }
        cursor.put(&self.vrefresh.to_ne_bytes());
        cursor.put(&self.flags.to_ne_bytes());
        cursor.put(&self.type_.to_ne_bytes());
        cursor.put(&self.name);
        bytes
    }

    /// Parses a blob record and validates the contained timings
    pub fn from_bytes(data: &[u8]) -> Result<Mode, Error> {
        if data.len() != MODE_INFO_SIZE {
            return Err(Error::InvalidUsage("mode blob has the wrong size"));
        }

        let u16_at = |offset: usize| u16::from_ne_bytes([data[offset], data[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_ne_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        };

        let mut name = [0u8; MODE_NAME_LEN];
        name.copy_from_slice(&data[36..]);

        let mode = Mode {
            clock: u32_at(0),
            hdisplay: u16_at(4),
            hsync_start: u16_at(6),
            hsync_end: u16_at(8),
            htotal: u16_at(10),
            hskew: u16_at(12),
            vdisplay: u16_at(14),
            vsync_start: u16_at(16),
            vsync_end: u16_at(18),
            vtotal: u16_at(20),
            vscan: u16_at(22),
            vrefresh: u32_at(24),
            flags: u32_at(28),
            type_: u32_at(32),
            name,
        };
        mode.validate()?;
        Ok(mode)
    }
}

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

#[cfg(test)]
mod tests {
    use super::{Mode, MODE_INFO_SIZE};
    use crate::error::Error;

    fn mode_1080p() -> Mode {
        Mode::new(148500, (1920, 2008, 2052, 2200), (1080, 1084, 1089, 1125), 60)
    }

    #[test]
    fn blob_record_parses_back() {
        let mode = mode_1080p();
        let bytes = mode.to_bytes();
        assert_eq!(bytes.len(), MODE_INFO_SIZE);
        let parsed = Mode::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, mode);
        assert_eq!(parsed.name(), "1920x1080");
    }

    #[test]
    fn wrong_size_is_rejected() {
        let bytes = mode_1080p().to_bytes();
        assert!(matches!(Mode::from_bytes(&bytes[..60]), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn inconsistent_timings_are_rejected() {
        let mut mode = mode_1080p();
        mode.hsync_start = 1000;
        assert!(mode.validate().is_err());

        let mut mode = mode_1080p();
        mode.clock = 0;
        assert!(Mode::from_bytes(&mode.to_bytes()).is_err());
    }

    #[test]
    fn long_names_are_truncated() {
        let mut mode = Mode::default();
        mode.set_name("a-very-long-mode-name-that-does-not-fit");
        assert_eq!(mode.name().len(), 31);
    }
}
