//! Chunked reader over a persisted snapshot
//!
//! Serves a snapshot directory as an ordered, finite sequence of
//! [`SnapshotChunk`]s. Files are visited in checksum order, each split into
//! chunks of at most `max_chunk_size` bytes. An empty file still yields one
//! empty chunk so the receiver creates it.
//!
//! The reader can be repositioned with [`SnapshotChunkReader::seek`] to any
//! `(file, offset)` pair, which is how an interrupted transfer resumes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use snapstore_core::{is_metadata_file, ChunkId, Result, SnapshotChunk, SnapshotId};

use crate::checksum::{chunk_checksum, sorted_file_names};
use crate::paths::list_file_names;

/// Default maximum chunk content size
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Iterates a snapshot directory as transfer chunks
#[derive(Debug)]
pub struct SnapshotChunkReader {
    directory: PathBuf,
    snapshot_id: String,
    snapshot_checksum: u64,
    files: Vec<String>,
    max_chunk_size: usize,
    file_index: usize,
    offset: u64,
}

impl SnapshotChunkReader {
    /// Open a reader over `directory`
    ///
    /// `snapshot_checksum` is the combined checksum of the snapshot, copied
    /// into every chunk so the receiver can check consistency.
    pub fn new(directory: &Path, snapshot_id: &SnapshotId, snapshot_checksum: u64) -> Result<Self> {
        let files = sorted_file_names(list_file_names(directory)?);
        Ok(SnapshotChunkReader {
            directory: directory.to_path_buf(),
            snapshot_id: snapshot_id.to_string(),
            snapshot_checksum,
            files,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            file_index: 0,
            offset: 0,
        })
    }

    /// Set the maximum content size of a chunk
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size.max(1);
        self
    }

    /// Number of files, announced to the receiver as the total chunk count
    pub fn total_count(&self) -> u32 {
        self.files.len() as u32
    }

    /// Files served, in transfer order
    pub fn file_names(&self) -> &[String] {
        &self.files
    }

    /// Id of the chunk the next call to `next` returns
    pub fn next_id(&self) -> Option<ChunkId> {
        self.files
            .get(self.file_index)
            .map(|name| ChunkId::new(name.clone(), self.offset))
    }

    /// Reposition to `id`
    ///
    /// An unknown file name positions at the first file ordered after it; an
    /// offset past the end of its file moves on to the next file.
    pub fn seek(&mut self, id: &ChunkId) {
        let key = (is_metadata_file(&id.file_name), id.file_name.as_str());
        self.file_index = self
            .files
            .partition_point(|name| (is_metadata_file(name), name.as_str()) < key);
        self.offset = match self.files.get(self.file_index) {
            Some(name) if *name == id.file_name => id.offset,
            _ => 0,
        };
    }

    /// Restart from the first chunk
    pub fn reset(&mut self) {
        self.file_index = 0;
        self.offset = 0;
    }

    fn read_chunk(&mut self) -> Option<Result<SnapshotChunk>> {
        loop {
            let name = self.files.get(self.file_index)?.clone();
            let path = self.directory.join(&name);

            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => return Some(Err(e.into())),
            };
            let total_file_size = match file.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => return Some(Err(e.into())),
            };

            if self.offset > total_file_size || (self.offset == total_file_size && self.offset > 0)
            {
                self.advance_file();
                continue;
            }

            let len = (total_file_size - self.offset).min(self.max_chunk_size as u64) as usize;
            let mut content = vec![0u8; len];
            let read = file
                .seek(SeekFrom::Start(self.offset))
                .and_then(|_| file.read_exact(&mut content));
            if let Err(e) = read {
                return Some(Err(e.into()));
            }

            let chunk = SnapshotChunk {
                snapshot_id: self.snapshot_id.clone(),
                total_count: self.total_count(),
                chunk_name: name,
                checksum: chunk_checksum(&content),
                snapshot_checksum: self.snapshot_checksum,
                content,
                file_block_position: self.offset,
                total_file_size,
            };

            self.offset += len as u64;
            if self.offset >= total_file_size {
                self.advance_file();
            }
            return Some(Ok(chunk));
        }
    }

    fn advance_file(&mut self) {
        self.file_index += 1;
        self.offset = 0;
    }
}

impl Iterator for SnapshotChunkReader {
    type Item = Result<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.read_chunk();
        if matches!(item, Some(Err(_))) {
            // Stop after a read error instead of retrying the same file forever.
            self.file_index = self.files.len();
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapstore_core::METADATA_FILE_NAME;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn snapshot_id() -> SnapshotId {
        SnapshotId::new(10, 1, 100, 50, None).unwrap()
    }

    fn setup(files: &[(&str, Vec<u8>)]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn reassemble(chunks: &[SnapshotChunk]) -> BTreeMap<String, Vec<u8>> {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for chunk in chunks {
            let file = files.entry(chunk.chunk_name.clone()).or_default();
            assert_eq!(file.len() as u64, chunk.file_block_position);
            file.extend_from_slice(&chunk.content);
        }
        files
    }

    #[test]
    fn test_reads_all_files_in_order() {
        let dir = setup(&[
            (METADATA_FILE_NAME, b"{}".to_vec()),
            ("b", vec![2; 10]),
            ("a", vec![1; 10]),
        ]);
        let reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 42).unwrap();
        assert_eq!(reader.total_count(), 3);

        let chunks: Vec<_> = reader.map(|c| c.unwrap()).collect();
        let names: Vec<_> = chunks.iter().map(|c| c.chunk_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", METADATA_FILE_NAME]);
        assert!(chunks.iter().all(|c| c.snapshot_id == "10-1-100-50"));
        assert!(chunks.iter().all(|c| c.snapshot_checksum == 42));
    }

    #[test]
    fn test_splits_large_files() {
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let dir = setup(&[("data", content.clone())]);
        let reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0)
            .unwrap()
            .with_max_chunk_size(1000);

        let chunks: Vec<_> = reader.map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content.len(), 1000);
        assert_eq!(chunks[2].content.len(), 500);
        assert_eq!(chunks[2].file_block_position, 2000);
        assert!(chunks.iter().all(|c| c.total_file_size == 2500));
        assert!(chunks.iter().all(|c| c.checksum == chunk_checksum(&c.content)));
        assert_eq!(reassemble(&chunks)["data"], content);
    }

    #[test]
    fn test_empty_file_yields_one_chunk() {
        let dir = setup(&[("empty", Vec::new()), ("full", vec![9; 3])]);
        let chunks: Vec<_> = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_name, "empty");
        assert!(chunks[0].content.is_empty());
        assert_eq!(chunks[0].total_file_size, 0);
    }

    #[test]
    fn test_seek_mid_file() {
        let dir = setup(&[("a", vec![1; 3000]), ("b", (0..255u8).collect())]);
        let mut reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0)
            .unwrap()
            .with_max_chunk_size(1024);

        reader.seek(&ChunkId::new("a", 2048));
        let chunk = reader.next().unwrap().unwrap();
        assert_eq!(chunk.chunk_name, "a");
        assert_eq!(chunk.file_block_position, 2048);
        assert_eq!(chunk.content.len(), 952);

        assert_eq!(reader.next_id(), Some(ChunkId::new("b", 0)));
        let chunk = reader.next().unwrap().unwrap();
        assert_eq!(chunk.content, (0..255u8).collect::<Vec<_>>());
        assert!(reader.next().is_none());
        assert!(reader.next_id().is_none());
    }

    #[test]
    fn test_seek_unknown_file_moves_to_following_file() {
        let dir = setup(&[("a", vec![1]), ("c", vec![3])]);
        let mut reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0).unwrap();

        reader.seek(&ChunkId::new("b", 77));
        assert_eq!(reader.next_id(), Some(ChunkId::new("c", 0)));
    }

    #[test]
    fn test_seek_past_end_of_file() {
        let dir = setup(&[("a", vec![1; 4]), ("b", vec![2; 4])]);
        let mut reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0).unwrap();

        reader.seek(&ChunkId::new("a", 100));
        let chunk = reader.next().unwrap().unwrap();
        assert_eq!(chunk.chunk_name, "b");
    }

    #[test]
    fn test_reset_restarts() {
        let dir = setup(&[("a", vec![1; 4])]);
        let mut reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0).unwrap();
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());

        reader.reset();
        assert_eq!(reader.next().unwrap().unwrap().chunk_name, "a");
    }

    #[test]
    fn test_seek_then_read_reproduces_tail() {
        let a: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        let b: Vec<u8> = (0..1500u32).map(|i| (i * 3 % 256) as u8).collect();
        let dir = setup(&[("a", a.clone()), ("b", b.clone())]);
        let mut reader = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0)
            .unwrap()
            .with_max_chunk_size(1024);

        // Read two chunks, "drop the connection", and resume from the next id.
        let mut chunks = vec![reader.next().unwrap().unwrap(), reader.next().unwrap().unwrap()];
        let resume_at = reader.next_id().unwrap();

        let mut resumed = SnapshotChunkReader::new(dir.path(), &snapshot_id(), 0)
            .unwrap()
            .with_max_chunk_size(1024);
        resumed.seek(&resume_at);
        chunks.extend(resumed.map(|c| c.unwrap()));

        let files = reassemble(&chunks);
        assert_eq!(files["a"], a);
        assert_eq!(files["b"], b);
    }
}
