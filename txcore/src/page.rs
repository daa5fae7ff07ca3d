//! The in-memory image of one block, with typed accessors.
//!
//! Layout of the typed values:
//! - integers are 8 bytes, little-endian;
//! - strings and byte arrays are an 8-byte little-endian length followed by
//!   the raw bytes.

use crate::error::{DbError, DbResult};

pub const INT_SIZE: usize = std::mem::size_of::<i64>();

/// A fixed-size byte buffer. The size never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Creates a zeroed page of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// Wraps existing bytes, typically one encoded log record.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes a string of `len` bytes occupies once encoded.
    pub fn max_length(len: usize) -> usize {
        INT_SIZE + len
    }

    fn check(&self, offset: usize, len: usize) -> DbResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(DbError::PageOverflow {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn get_int(&self, offset: usize) -> DbResult<i64> {
        self.check(offset, INT_SIZE)?;
        let mut raw = [0u8; INT_SIZE];
        raw.copy_from_slice(&self.data[offset..offset + INT_SIZE]);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn set_int(&mut self, offset: usize, val: i64) -> DbResult<()> {
        self.check(offset, INT_SIZE)?;
        self.data[offset..offset + INT_SIZE].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    pub fn get_bytes(&self, offset: usize) -> DbResult<&[u8]> {
        let len = self.get_int(offset)?;
        let len = usize::try_from(len).map_err(|_| DbError::PageOverflow {
            offset,
            len: usize::MAX,
            size: self.data.len(),
        })?;
        let start = offset + INT_SIZE;
        self.check(start, len)?;
        Ok(&self.data[start..start + len])
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> DbResult<()> {
        self.check(offset, Self::max_length(bytes.len()))?;
        self.set_int(offset, bytes.len() as i64)?;
        let start = offset + INT_SIZE;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a string. Bytes that are not valid UTF-8 are replaced.
    pub fn get_string(&self, offset: usize) -> DbResult<String> {
        let bytes = self.get_bytes(offset)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn set_string(&mut self, offset: usize, val: &str) -> DbResult<()> {
        self.set_bytes(offset, val.as_bytes())
    }

    /// The `len` bytes at `offset`, whatever they encode.
    pub fn get_raw(&self, offset: usize, len: usize) -> DbResult<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn set_raw(&mut self, offset: usize, bytes: &[u8]) -> DbResult<()> {
        self.check(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_string_layout() {
        let mut page = Page::new(64);
        page.set_int(0, -2).unwrap();
        page.set_string(8, "hello,世界").unwrap();

        assert_eq!(page.get_int(0).unwrap(), -2);
        assert_eq!(page.get_string(8).unwrap(), "hello,世界");
        // Length prefix is the byte length, little-endian.
        assert_eq!(&page.contents()[8..16], &13u64.to_le_bytes());
        assert_eq!(Page::max_length("hello,世界".len()), 21);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut page = Page::new(16);
        assert!(page.set_int(9, 1).is_err());
        assert!(page.set_string(0, "this string is too long").is_err());
        // A garbage length prefix must not panic.
        page.set_int(0, i64::MAX).unwrap();
        assert!(matches!(
            page.get_string(0),
            Err(DbError::PageOverflow { .. })
        ));
        page.set_int(0, -5).unwrap();
        assert!(page.get_bytes(0).is_err());
    }

    #[test]
    fn test_raw_access_ignores_encoding() {
        let mut page = Page::new(16);
        page.set_int(0, 1000).unwrap();
        assert!(page.get_string(0).is_err());
        let raw = page.get_raw(0, 11).unwrap().to_vec();
        assert_eq!(&raw[..8], &1000i64.to_le_bytes());

        page.set_string(0, "abc").unwrap();
        page.set_raw(0, &raw).unwrap();
        assert_eq!(page.get_int(0).unwrap(), 1000);
        assert_eq!(&page.contents()[8..11], &[0, 0, 0]);
        assert!(page.get_raw(10, 7).is_err());
        assert!(page.set_raw(15, &[1, 2]).is_err());
    }
}
