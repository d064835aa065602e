use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Unexpected end of input: needed {0} bytes but only {1} available")]
    UnexpectedEnd(usize, usize),
    #[error("Invalid size: expected {0} bytes, got {1}")]
    InvalidSize(usize, usize),
    #[error("Invalid value")]
    InvalidValue,
    #[error("Invalid hex")]
    InvalidHex,
    #[error("Non-canonical encoding")]
    NonCanonical,
    #[error("Expected a list, found a byte string")]
    ExpectedList,
    #[error("Expected a byte string, found a list")]
    ExpectedString,
    #[error("Integer of {0} bytes does not fit")]
    IntegerOverflow(usize),
    #[error("{0} bytes of trailing data")]
    TrailingData(usize),
}

// Header of the next item in the buffer
struct Header {
    is_list: bool,
    // Bytes taken by the prefix
    offset: usize,
    // Bytes taken by the payload
    length: usize,
}

/// Cursor over a buffer of consecutive rlp items.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    // Bytes left to read
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_next_list(&self) -> Result<bool, ReaderError> {
        Ok(self.peek_header()?.is_list)
    }

    fn long_length(&self, size: usize) -> Result<usize, ReaderError> {
        if self.bytes.len() < 1 + size {
            return Err(ReaderError::UnexpectedEnd(1 + size, self.bytes.len()));
        }

        let length_bytes = &self.bytes[1..1 + size];
        if length_bytes[0] == 0 {
            return Err(ReaderError::NonCanonical);
        }

        if size > std::mem::size_of::<usize>() {
            return Err(ReaderError::IntegerOverflow(size));
        }

        let length = length_bytes
            .iter()
            .fold(0usize, |acc, byte| (acc << 8) | *byte as usize);
        if length <= 55 {
            return Err(ReaderError::NonCanonical);
        }

        Ok(length)
    }

    fn peek_header(&self) -> Result<Header, ReaderError> {
        let prefix = *self
            .bytes
            .first()
            .ok_or(ReaderError::UnexpectedEnd(1, 0))?;

        let header = match prefix {
            0x00..=0x7f => Header {
                is_list: false,
                offset: 0,
                length: 1,
            },
            0x80..=0xb7 => Header {
                is_list: false,
                offset: 1,
                length: (prefix - 0x80) as usize,
            },
            0xb8..=0xbf => {
                let size = (prefix - 0xb7) as usize;
                Header {
                    is_list: false,
                    offset: 1 + size,
                    length: self.long_length(size)?,
                }
            }
            0xc0..=0xf7 => Header {
                is_list: true,
                offset: 1,
                length: (prefix - 0xc0) as usize,
            },
            0xf8..=0xff => {
                let size = (prefix - 0xf7) as usize;
                Header {
                    is_list: true,
                    offset: 1 + size,
                    length: self.long_length(size)?,
                }
            }
        };

        let total = header
            .offset
            .checked_add(header.length)
            .ok_or(ReaderError::IntegerOverflow(header.offset))?;
        if total > self.bytes.len() {
            return Err(ReaderError::UnexpectedEnd(total, self.bytes.len()));
        }

        // A single byte below 0x80 must be encoded as itself
        if prefix == 0x81 && self.bytes[1] < 0x80 {
            return Err(ReaderError::NonCanonical);
        }

        Ok(header)
    }

    // Consume the next item, returning its header and the full item bytes
    fn next_item(&mut self) -> Result<(Header, &'a [u8]), ReaderError> {
        let header = self.peek_header()?;
        let (item, rest) = self.bytes.split_at(header.offset + header.length);
        self.bytes = rest;
        Ok((header, item))
    }

    /// Read the next item as a byte string.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ReaderError> {
        let header = self.peek_header()?;
        if header.is_list {
            return Err(ReaderError::ExpectedString);
        }

        let (header, item) = self.next_item()?;
        Ok(&item[header.offset..])
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], ReaderError> {
        let bytes = self.read_bytes()?;
        bytes
            .try_into()
            .map_err(|_| ReaderError::InvalidSize(N, bytes.len()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.read_bytes()?;
        if bytes.len() > 8 {
            return Err(ReaderError::IntegerOverflow(bytes.len()));
        }

        if bytes.first() == Some(&0) {
            return Err(ReaderError::NonCanonical);
        }

        Ok(bytes
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64))
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let value = self.read_u64()?;
        u16::try_from(value).map_err(|_| ReaderError::InvalidValue)
    }

    /// Enter the next item, which must be a list.
    pub fn read_list(&mut self) -> Result<Reader<'a>, ReaderError> {
        let header = self.peek_header()?;
        if !header.is_list {
            return Err(ReaderError::ExpectedList);
        }

        let (header, item) = self.next_item()?;
        Ok(Reader::new(&item[header.offset..]))
    }

    /// Next item exactly as encoded, header included.
    pub fn read_raw(&mut self) -> Result<&'a [u8], ReaderError> {
        self.next_item().map(|(_, item)| item)
    }
}
