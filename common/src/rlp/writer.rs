/// Appends rlp items to a byte buffer.
pub struct Writer<'a> {
    bytes: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(bytes: &'a mut Vec<u8>) -> Self {
        Self { bytes }
    }

    fn write_header(&mut self, short_base: u8, long_base: u8, length: usize) {
        if length <= 55 {
            self.bytes.push(short_base + length as u8);
        } else {
            let be = (length as u64).to_be_bytes();
            let skip = be.iter().take_while(|byte| **byte == 0).count();
            self.bytes.push(long_base + (be.len() - skip) as u8);
            self.bytes.extend_from_slice(&be[skip..]);
        }
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        if value.len() == 1 && value[0] < 0x80 {
            self.bytes.push(value[0]);
        } else {
            self.write_header(0x80, 0xb7, value.len());
            self.bytes.extend_from_slice(value);
        }
    }

    // Integers are big endian without leading zeros, zero being the empty string
    pub fn write_u64(&mut self, value: u64) {
        let be = value.to_be_bytes();
        let skip = be.iter().take_while(|byte| **byte == 0).count();
        self.write_bytes(&be[skip..]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_u64(value as u64);
    }

    // Append an already encoded item
    pub fn write_raw(&mut self, item: &[u8]) {
        self.bytes.extend_from_slice(item);
    }

    pub fn write_list<F: FnOnce(&mut Writer)>(&mut self, f: F) {
        let mut payload = Vec::new();
        {
            let mut writer = Writer::new(&mut payload);
            f(&mut writer);
        }
        self.write_header(0xc0, 0xf7, payload.len());
        self.bytes.extend_from_slice(&payload);
    }

    pub fn total_write(&self) -> usize {
        self.bytes.len()
    }
}
