//! Chunk key - the identity of a column segment.

use std::fmt;

/// Identifies a physically contiguous column segment.
///
/// A key is an ordered integer tuple: `(database id, table id, column id,
/// fragment id[, partition sub-id])`. Keys are totally ordered, and a
/// shorter key is the ancestor of every longer key it prefixes — the
/// catalog enumerates all chunks of a table by querying with the table
/// prefix.
///
/// # Example
/// ```
/// use stratadb::ChunkKey;
///
/// let chunk = ChunkKey::of_fragment(1, 7, 2, 0);
/// let table = ChunkKey::table_prefix(1, 7);
/// assert!(table.is_prefix_of(&chunk));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey(Vec<i32>);

impl ChunkKey {
    /// Create a key from raw parts.
    pub fn new(parts: Vec<i32>) -> Self {
        ChunkKey(parts)
    }

    /// Full key of one column fragment.
    pub fn of_fragment(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        ChunkKey(vec![db_id, table_id, column_id, fragment_id])
    }

    /// Full key of one partition of a column fragment.
    pub fn of_partition(
        db_id: i32,
        table_id: i32,
        column_id: i32,
        fragment_id: i32,
        partition_id: i32,
    ) -> Self {
        ChunkKey(vec![db_id, table_id, column_id, fragment_id, partition_id])
    }

    /// Prefix covering every chunk of a table.
    pub fn table_prefix(db_id: i32, table_id: i32) -> Self {
        ChunkKey(vec![db_id, table_id])
    }

    /// Prefix covering every fragment of a column.
    pub fn column_prefix(db_id: i32, table_id: i32, column_id: i32) -> Self {
        ChunkKey(vec![db_id, table_id, column_id])
    }

    /// The raw key parts.
    #[inline]
    pub fn parts(&self) -> &[i32] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this key is an ancestor of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &ChunkKey) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = ChunkKey::of_fragment(1, 1, 1, 0);
        let b = ChunkKey::of_fragment(1, 1, 1, 1);
        let c = ChunkKey::of_fragment(1, 1, 2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_prefix_sorts_before_descendants() {
        let prefix = ChunkKey::table_prefix(1, 1);
        let chunk = ChunkKey::of_fragment(1, 1, 1, 0);
        assert!(prefix < chunk);
    }

    #[test]
    fn test_prefix_matching() {
        let table = ChunkKey::table_prefix(1, 7);
        let column = ChunkKey::column_prefix(1, 7, 3);
        let chunk = ChunkKey::of_fragment(1, 7, 3, 4);
        let other = ChunkKey::of_fragment(1, 8, 3, 4);

        assert!(table.is_prefix_of(&chunk));
        assert!(column.is_prefix_of(&chunk));
        assert!(chunk.is_prefix_of(&chunk));
        assert!(!table.is_prefix_of(&other));
        assert!(!chunk.is_prefix_of(&column));
    }

    #[test]
    fn test_partition_sub_id() {
        let frag = ChunkKey::of_fragment(1, 2, 3, 4);
        let part = ChunkKey::of_partition(1, 2, 3, 4, 9);
        assert!(frag.is_prefix_of(&part));
        assert_eq!(part.len(), 5);
    }

    #[test]
    fn test_display() {
        let key = ChunkKey::of_fragment(1, 2, 3, 0);
        assert_eq!(format!("{}", key), "(1,2,3,0)");
    }
}
