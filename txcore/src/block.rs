//! Block identity.
use std::fmt;

/// Number reserved for the virtual "end of file" block that `size` and
/// `append` lock on.
pub const END_OF_FILE: u64 = u64::MAX;

/// Identifies one fixed-size block inside a named file.
///
/// Equality and hashing are by value, so two independently built ids for the
/// same `(file, number)` pair share cache slots and locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    file_name: String,
    number: u64,
}

impl BlockId {
    pub fn new(file_name: impl Into<String>, number: u64) -> Self {
        Self {
            file_name: file_name.into(),
            number,
        }
    }

    /// The lock key standing for "one past the last block" of `file_name`.
    pub fn end_of_file(file_name: impl Into<String>) -> Self {
        Self::new(file_name, END_OF_FILE)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// The block that follows this one in the same file.
    pub fn next(&self) -> Option<BlockId> {
        self.number
            .checked_add(1)
            .filter(|&n| n != END_OF_FILE)
            .map(|n| BlockId::new(self.file_name.clone(), n))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.number == END_OF_FILE {
            write!(f, "[file {}, eof]", self.file_name)
        } else {
            write!(f, "[file {}, block {}]", self.file_name, self.number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_value_identity() {
        let mut map = HashMap::new();
        map.insert(BlockId::new("students.tbl", 3), 1);
        // A separately constructed id must hit the same entry.
        let probe = BlockId::new(String::from("students.tbl"), 3);
        assert_eq!(map.get(&probe), Some(&1));
        assert_ne!(probe, BlockId::new("students.tbl", 4));
        assert_ne!(probe, BlockId::new("courses.tbl", 3));
    }

    #[test]
    fn test_next_and_display() {
        let blk = BlockId::new("f", 7);
        assert_eq!(blk.next(), Some(BlockId::new("f", 8)));
        assert_eq!(blk.to_string(), "[file f, block 7]");
        assert_eq!(BlockId::end_of_file("f").to_string(), "[file f, eof]");
        assert_eq!(BlockId::new("f", END_OF_FILE - 1).next(), None);
    }
}
