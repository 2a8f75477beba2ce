use std::fmt;

use super::ObjectId;

/// Immutable, reference counted data attached to properties
///
/// Blobs are handed around as `Arc<PropertyBlob>`. Every state using the blob holds
/// a reference. Blobs created by clients are additionally kept alive by the device
/// until they get destroyed, mode blobs created by the core vanish with their last state.
pub struct PropertyBlob {
    pub(crate) id: ObjectId,
    pub(crate) data: Box<[u8]>,
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBlob")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

impl PropertyBlob {
    /// Id of this blob
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Contents of this blob
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of the contents in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true, if the blob contains no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A 3x3 color transformation matrix in S31.32 sign-magnitude format
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ColorCtm {
    /// Row-major coefficients
    pub matrix: [u64; 9],
}

impl ColorCtm {
    /// Size of the blob representation
    pub const SIZE: usize = 9 * std::mem::size_of::<u64>();

    /// Serializes the matrix into blob contents
    pub fn to_bytes(&self) -> Vec<u8> {
        self.matrix.iter().flat_map(|c| c.to_ne_bytes()).collect()
    }
}

/// One entry of a gamma or degamma lookup table
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ColorLut {
    /// Red channel
    pub red: u16,
    /// Green channel
    pub green: u16,
    /// Blue channel
    pub blue: u16,
}

impl ColorLut {
    /// Size of one entry in the blob representation
    pub const SIZE: usize = 4 * std::mem::size_of::<u16>();

    /// Serializes a lookup table into blob contents
    pub fn table_to_bytes(table: &[ColorLut]) -> Vec<u8> {
        table
            .iter()
            .flat_map(|entry| {
                let mut bytes = [0u8; Self::SIZE];
                bytes[0..2].copy_from_slice(&entry.red.to_ne_bytes());
                bytes[2..4].copy_from_slice(&entry.green.to_ne_bytes());
                bytes[4..6].copy_from_slice(&entry.blue.to_ne_bytes());
                bytes
            })
            .collect()
    }
}
