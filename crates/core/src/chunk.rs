//! Chunk layout and object key naming.

use crate::error::Error;
use crate::session::{SessionId, ShareId};
use std::ops::Range;
use uuid::Uuid;

/// How a file of a given size is split into fixed-size chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes; the last one
/// carries the remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(file_size: u64, chunk_size: u64) -> crate::Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkLayout(
                "chunk size must be positive".to_string(),
            ));
        }
        if file_size == 0 {
            return Err(Error::InvalidChunkLayout("file is empty".to_string()));
        }
        let layout = Self {
            file_size,
            chunk_size,
        };
        if u32::try_from(layout.count_u64()).is_err() {
            return Err(Error::InvalidChunkLayout(format!(
                "{file_size} bytes in {chunk_size}-byte chunks exceeds the chunk count limit"
            )));
        }
        Ok(layout)
    }

    fn count_u64(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks, `ceil(file_size / chunk_size)`.
    pub fn total_chunks(&self) -> u32 {
        // Bounded in new()
        self.count_u64() as u32
    }

    /// Byte range of a chunk within the file. Chunks are numbered from 0.
    pub fn chunk_range(&self, chunk_number: u32) -> crate::Result<Range<u64>> {
        if chunk_number >= self.total_chunks() {
            return Err(Error::ChunkOutOfRange {
                chunk_number,
                total_chunks: self.total_chunks(),
            });
        }
        let start = u64::from(chunk_number) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Ok(start..end)
    }

    /// Size in bytes of a chunk.
    pub fn chunk_len(&self, chunk_number: u32) -> crate::Result<u64> {
        self.chunk_range(chunk_number).map(|r| r.end - r.start)
    }
}

/// Largest chunk implied by splitting `file_size` into `total_chunks` parts.
pub fn max_chunk_len(file_size: u64, total_chunks: u32) -> u64 {
    if total_chunks == 0 {
        return file_size;
    }
    file_size.div_ceil(u64::from(total_chunks))
}

/// Object key prefix holding all temporary chunks of a session.
pub fn session_chunk_prefix(session_id: &SessionId) -> String {
    format!("sessions/{session_id}/chunks/")
}

/// Object key of one temporary chunk.
pub fn chunk_object_key(session_id: &SessionId, chunk_number: u32) -> String {
    format!("{}{chunk_number:06}", session_chunk_prefix(session_id))
}

/// Object key of an assembled video.
pub fn video_object_key(owner_id: &Uuid, share_id: &ShareId) -> String {
    format!("videos/{owner_id}/{share_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_layout_counts() {
        let layout = ChunkLayout::new(50 * MIB, 5 * MIB).unwrap();
        assert_eq!(layout.total_chunks(), 10);
        assert_eq!(layout.chunk_len(9).unwrap(), 5 * MIB);

        let layout = ChunkLayout::new(100, 30).unwrap();
        assert_eq!(layout.total_chunks(), 4);
        assert_eq!(layout.chunk_range(0).unwrap(), 0..30);
        assert_eq!(layout.chunk_range(3).unwrap(), 90..100); // Last chunk is smaller
        assert!(layout.chunk_range(4).is_err());
    }

    #[test]
    fn test_layout_rejects_degenerate_input() {
        assert!(ChunkLayout::new(0, 5 * MIB).is_err());
        assert!(ChunkLayout::new(10, 0).is_err());
        assert!(ChunkLayout::new(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_max_chunk_len() {
        assert_eq!(max_chunk_len(50 * MIB, 10), 5 * MIB);
        assert_eq!(max_chunk_len(101, 10), 11);
        assert_eq!(max_chunk_len(7, 0), 7);
    }

    #[test]
    fn test_object_keys() {
        let session = SessionId::new();
        let key = chunk_object_key(&session, 3);
        assert_eq!(key, format!("sessions/{session}/chunks/000003"));
        assert!(key.starts_with(&session_chunk_prefix(&session)));

        let owner = Uuid::new_v4();
        let share = ShareId::generate();
        assert_eq!(
            video_object_key(&owner, &share),
            format!("videos/{owner}/{share}")
        );
    }
}
