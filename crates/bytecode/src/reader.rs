//! Bounds-checked cursor over a bytecode image. All multi-byte values
//! are little-endian; failures report the offending offset.

use fugue_vm::RuntimeError;

/// Errors raised while decoding a bytecode image. All are fatal: the
/// loader drops everything built so far and reports the offset.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("binary image does not carry a valid signature cookie")]
    InvalidCookie,

    #[error("unexpected end of stream at offset {0:#x}")]
    UnexpectedEof(usize),

    #[error("expected instruction {expected:#04x} but found {found:#04x} at offset {offset:#x}")]
    ExpectedInstruction {
        expected: u8,
        found: u8,
        offset: usize,
    },

    #[error("unknown opcode {opcode:#04x} at offset {offset:#x}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("unknown type id {raw} at offset {offset:#x}")]
    UnknownType { raw: u32, offset: usize },

    #[error("unsupported cast from type {from} to type {to} at offset {offset:#x}")]
    UnknownCast { from: u32, to: u32, offset: usize },

    #[error("malformed stream: {detail} at offset {offset:#x}")]
    Malformed { detail: String, offset: usize },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub struct ByteReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        ByteReader { buffer, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        if self.offset + len > self.buffer.len() {
            return Err(LoadError::UnexpectedEof(self.offset));
        }
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_opcode(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    pub fn peek_opcode(&self) -> Result<u8, LoadError> {
        self.buffer
            .get(self.offset)
            .copied()
            .ok_or(LoadError::UnexpectedEof(self.offset))
    }

    /// Consume one opcode and require it to be `expected`.
    pub fn expect(&mut self, expected: u8) -> Result<(), LoadError> {
        let offset = self.offset;
        let found = self.read_opcode()?;
        if found != expected {
            return Err(LoadError::ExpectedInstruction {
                expected,
                found,
                offset,
            });
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32, LoadError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, LoadError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_flag(&mut self) -> Result<bool, LoadError> {
        Ok(self.take(1)?[0] != 0)
    }

    /// NUL-terminated UTF-8 string.
    pub fn read_str0(&mut self) -> Result<String, LoadError> {
        let start = self.offset;
        let terminator = self.buffer[self.offset..]
            .iter()
            .position(|b| *b == 0)
            .ok_or(LoadError::UnexpectedEof(start))?;
        let bytes = self.take(terminator)?;
        self.take(1)?; // the NUL
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Malformed {
            detail: "string is not valid UTF-8".to_string(),
            offset: start,
        })
    }

    /// Length-prefixed string: `i32` length followed by raw bytes.
    pub fn read_strn(&mut self) -> Result<String, LoadError> {
        let start = self.offset;
        let len = self.read_i32()?;
        if len < 0 {
            return Err(LoadError::Malformed {
                detail: "negative string length".to_string(),
                offset: start,
            });
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Malformed {
            detail: "string is not valid UTF-8".to_string(),
            offset: start,
        })
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, LoadError> {
        Ok(self.take(len)?.to_vec())
    }

    /// Compare and consume the header cookie.
    pub fn check_cookie(&mut self, cookie: &[u8]) -> Result<(), LoadError> {
        if self.buffer.len() < self.offset + cookie.len()
            || &self.buffer[self.offset..self.offset + cookie.len()] != cookie
        {
            return Err(LoadError::InvalidCookie);
        }
        self.offset += cookie.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_reads() {
        let mut data = Vec::new();
        data.extend_from_slice(&42i32.to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.push(1);
        data.extend_from_slice(b"name\0");
        data.extend_from_slice(&3i32.to_le_bytes());
        data.extend_from_slice(b"abc");

        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_i32().unwrap(), 42);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert!(reader.read_flag().unwrap());
        assert_eq!(reader.read_str0().unwrap(), "name");
        assert_eq!(reader.read_strn().unwrap(), "abc");
    }

    #[test]
    fn test_eof_reports_offset() {
        let mut reader = ByteReader::new(&[1, 2]);
        reader.read_opcode().unwrap();
        reader.read_opcode().unwrap();
        assert!(matches!(
            reader.read_opcode(),
            Err(LoadError::UnexpectedEof(2))
        ));
    }

    #[test]
    fn test_expect_mismatch() {
        let mut reader = ByteReader::new(&[9]);
        let err = reader.expect(7).unwrap_err();
        match err {
            LoadError::ExpectedInstruction {
                expected,
                found,
                offset,
            } => {
                assert_eq!(expected, 7);
                assert_eq!(found, 9);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cookie_check() {
        let mut reader = ByteReader::new(b"FUGUEVM1rest");
        assert!(reader.check_cookie(b"FUGUEVM1").is_ok());
        assert_eq!(reader.offset(), 8);

        let mut reader = ByteReader::new(b"WRONG");
        assert!(matches!(
            reader.check_cookie(b"FUGUEVM1"),
            Err(LoadError::InvalidCookie)
        ));
    }
}
