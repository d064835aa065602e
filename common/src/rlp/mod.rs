//! Recursive length prefix (rlp) codec.
//!
//! Node records and every discovery packet body are rlp items: either a byte
//! string or a list of items. The [`Reader`] only accepts canonical encodings,
//! so two different byte strings can never decode to the same value.

mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

/// A value with a single rlp representation.
pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn write(&self, writer: &mut Writer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes);
        self.write(&mut writer);
        bytes
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    // Decode a complete item, rejecting any bytes left after it
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(ReaderError::TrailingData(reader.size()));
        }

        Ok(value)
    }

    fn from_hex(hex: &str) -> Result<Self, ReaderError> {
        let bytes = hex::decode(hex).map_err(|_| ReaderError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

impl Serializer for u64 {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }
}

impl Serializer for u16 {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self as u64);
    }
}

impl Serializer for Vec<u8> {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_bytes().map(<[u8]>::to_vec)
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(self);
    }
}
