//! Write path: split input into blocks, store each distinct block once, and
//! record the stream's digest sequence in its manifest.

use std::collections::HashSet;
use std::io::{ErrorKind, Read};

use dedup_index::{IndexStore, PendingEntry};
use dedup_types::block::blocks;
use dedup_types::Digest;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::StoreResult;
use crate::manifest::ManifestWriter;
use crate::segment::SegmentManager;

/// Statistics for one ingested chunk, or a whole stream when accumulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkReport {
    /// Input bytes recorded.
    pub bytes: usize,
    /// Blocks appended to the manifest.
    pub blocks: usize,
    /// Blocks written to a segment.
    pub new_blocks: usize,
    /// Blocks already stored, in the index or earlier in the same chunk.
    pub duplicate_blocks: usize,
}

impl ChunkReport {
    pub fn merge(&mut self, other: ChunkReport) {
        self.bytes += other.bytes;
        self.blocks += other.blocks;
        self.new_blocks += other.new_blocks;
        self.duplicate_blocks += other.duplicate_blocks;
    }
}

/// Ingests one stream under a new name.
///
/// Every error is fatal for the stream. Blocks stored before the error stay
/// stored; the manifest may be left holding a prefix of the stream.
#[derive(Debug)]
pub struct StreamWriter {
    name: String,
    manifest: ManifestWriter,
    segments: SegmentManager,
    total: ChunkReport,
}

impl StreamWriter {
    /// Create the manifest for `name` and select the segment to append to.
    pub fn create<I: IndexStore>(ctx: &mut Context<I>, name: &str) -> StoreResult<Self> {
        let path = ctx.config.manifest_path(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut manifest = ManifestWriter::create(&mut ctx.pool, &path)?;
        let segments = match SegmentManager::open(ctx) {
            Ok(segments) => segments,
            Err(e) => {
                manifest.close(&mut ctx.pool)?;
                return Err(e);
            }
        };
        info!(stream = name, manifest = %path.display(), "writing stream");
        Ok(Self {
            name: name.to_string(),
            manifest,
            segments,
            total: ChunkReport::default(),
        })
    }

    /// Record one chunk of input.
    pub fn write_chunk<I: IndexStore>(
        &mut self,
        ctx: &mut Context<I>,
        buf: &[u8],
    ) -> StoreResult<ChunkReport> {
        if buf.is_empty() {
            return Ok(ChunkReport::default());
        }
        let chunk: Vec<(Digest, &[u8])> = blocks(buf).map(|b| (Digest::of(b), b)).collect();
        let digests: Vec<Digest> = chunk.iter().map(|(d, _)| *d).collect();
        self.manifest.append(&mut ctx.pool, &digests)?;

        let mut seen = HashSet::with_capacity(chunk.len());
        let unique: Vec<(Digest, &[u8])> = chunk
            .iter()
            .filter(|(digest, _)| seen.insert(*digest))
            .copied()
            .collect();
        let unique_digests: Vec<Digest> = unique.iter().map(|(d, _)| *d).collect();
        let stored = ctx.index.batch_exists(&unique_digests)?;

        let mut staged = Vec::with_capacity(unique.len() - stored.len().min(unique.len()));
        for (digest, payload) in unique.iter().filter(|(d, _)| !stored.contains(d)) {
            let location = self.segments.append(ctx, payload)?;
            staged.push(PendingEntry::new(*digest, location.segment, location.offset));
        }
        if !staged.is_empty() {
            ctx.index.batch_insert(&staged)?;
        }

        let report = ChunkReport {
            bytes: buf.len(),
            blocks: chunk.len(),
            new_blocks: staged.len(),
            duplicate_blocks: chunk.len() - staged.len(),
        };
        debug!(
            stream = %self.name,
            bytes = report.bytes,
            blocks = report.blocks,
            new = report.new_blocks,
            duplicate = report.duplicate_blocks,
            "chunk recorded"
        );
        self.total.merge(report);
        Ok(report)
    }

    /// Ingest everything `input` yields, one full buffer at a time.
    ///
    /// Each buffer is filled completely before it is recorded, so only the
    /// final block of the stream can be short.
    pub fn write_all_from<I: IndexStore, R: Read>(
        &mut self,
        ctx: &mut Context<I>,
        input: &mut R,
    ) -> StoreResult<ChunkReport> {
        let mut buf = vec![0u8; ctx.config.read_buffer_size];
        loop {
            let len = fill(input, &mut buf)?;
            if len == 0 {
                break;
            }
            self.write_chunk(ctx, &buf[..len])?;
            if len < buf.len() {
                break;
            }
        }
        Ok(self.total)
    }

    /// Totals over every chunk written so far.
    pub fn report(&self) -> ChunkReport {
        self.total
    }

    /// Close the manifest and the current segment.
    pub fn finish<I: IndexStore>(mut self, ctx: &mut Context<I>) -> StoreResult<ChunkReport> {
        let manifest = self.manifest.close(&mut ctx.pool);
        let segments = self.segments.close(&mut ctx.pool);
        manifest?;
        segments?;
        info!(
            stream = %self.name,
            bytes = self.total.bytes,
            blocks = self.total.blocks,
            new = self.total.new_blocks,
            "stream written"
        );
        Ok(self.total)
    }
}

/// Read until `buf` is full or `input` is exhausted.
fn fill<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::StoreError;
    use dedup_index::InMemoryIndexStore;

    fn context(root: &std::path::Path) -> Context<InMemoryIndexStore> {
        let config = StoreConfig {
            handle_limit: Some(8),
            read_buffer_size: 64,
            ..StoreConfig::with_root(root)
        };
        std::fs::create_dir_all(config.segments_path()).unwrap();
        std::fs::create_dir_all(config.manifests_path()).unwrap();
        Context::open(config, InMemoryIndexStore::new()).unwrap()
    }

    fn segment_bytes(ctx: &Context<InMemoryIndexStore>) -> Vec<u8> {
        std::fs::read(ctx.config.segments_path().join("sha256_16_000000")).unwrap()
    }

    #[test]
    fn chunk_with_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut w = StreamWriter::create(&mut ctx, "s").unwrap();
        let report = w.write_chunk(&mut ctx, b"ABCDEFGHIJKLMNOPQRST").unwrap();
        assert_eq!(
            report,
            ChunkReport {
                bytes: 20,
                blocks: 2,
                new_blocks: 2,
                duplicate_blocks: 0
            }
        );
        w.finish(&mut ctx).unwrap();

        let seg = segment_bytes(&ctx);
        assert_eq!(seg.len(), 17 + 5);
        assert_eq!(seg[0], 16);
        assert_eq!(&seg[1..17], b"ABCDEFGHIJKLMNOP");
        assert_eq!(seg[17], 4);
        assert_eq!(&seg[18..], b"QRST");
        assert_eq!(ctx.index.len(), 2);
        let manifest = std::fs::read(ctx.config.manifest_path("s").unwrap()).unwrap();
        assert_eq!(manifest.len(), 64);
    }

    #[test]
    fn duplicate_blocks_in_one_chunk_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut w = StreamWriter::create(&mut ctx, "dup").unwrap();
        let report = w.write_chunk(&mut ctx, &[b'a'; 32]).unwrap();
        assert_eq!(report.new_blocks, 1);
        assert_eq!(report.duplicate_blocks, 1);
        w.finish(&mut ctx).unwrap();

        assert_eq!(segment_bytes(&ctx).len(), 17);
        assert_eq!(ctx.index.len(), 1);
        let manifest = std::fs::read(ctx.config.manifest_path("dup").unwrap()).unwrap();
        assert_eq!(manifest.len(), 64);
        assert_eq!(manifest[..32], manifest[32..]);
    }

    #[test]
    fn second_stream_reuses_stored_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut w = StreamWriter::create(&mut ctx, "one").unwrap();
        w.write_chunk(&mut ctx, b"0123456789abcdef").unwrap();
        w.finish(&mut ctx).unwrap();

        let mut w = StreamWriter::create(&mut ctx, "two").unwrap();
        let report = w.write_chunk(&mut ctx, b"0123456789abcdef").unwrap();
        assert_eq!(report.new_blocks, 0);
        assert_eq!(report.duplicate_blocks, 1);
        w.finish(&mut ctx).unwrap();
        assert_eq!(segment_bytes(&ctx).len(), 17);
    }

    #[test]
    fn write_all_from_reader_spans_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let input: Vec<u8> = (0..150u8).collect();
        let mut w = StreamWriter::create(&mut ctx, "big").unwrap();
        let total = w.write_all_from(&mut ctx, &mut input.as_slice()).unwrap();
        assert_eq!(total.bytes, 150);
        assert_eq!(total.blocks, 10);
        assert_eq!(w.report(), total);
        w.finish(&mut ctx).unwrap();
        let manifest = std::fs::read(ctx.config.manifest_path("big").unwrap()).unwrap();
        assert_eq!(manifest.len(), 10 * 32);
    }

    #[test]
    fn empty_input_leaves_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut w = StreamWriter::create(&mut ctx, "empty").unwrap();
        let total = w.write_all_from(&mut ctx, &mut std::io::empty()).unwrap();
        assert_eq!(total, ChunkReport::default());
        w.finish(&mut ctx).unwrap();
        let manifest = std::fs::read(ctx.config.manifest_path("empty").unwrap()).unwrap();
        assert!(manifest.is_empty());
        assert!(ctx.pool.is_empty());
    }

    #[test]
    fn nested_names_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let w = StreamWriter::create(&mut ctx, "logs/2024/app").unwrap();
        w.finish(&mut ctx).unwrap();
        assert!(ctx.config.manifests_path().join("logs/2024/app").exists());
    }

    #[test]
    fn existing_stream_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        StreamWriter::create(&mut ctx, "s").unwrap().finish(&mut ctx).unwrap();
        assert!(StreamWriter::create(&mut ctx, "s").is_err());
        assert!(ctx.pool.is_empty());
    }

    #[test]
    fn index_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut w = StreamWriter::create(&mut ctx, "s").unwrap();
        ctx.index.set_unavailable(true);
        let err = w.write_chunk(&mut ctx, b"data").unwrap_err();
        assert!(matches!(err, StoreError::Index(_)));
    }

    /// Yields at most three bytes per read.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(3).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn short_reads_are_gathered_into_whole_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let input: Vec<u8> = (0..100u8).collect();
        let mut w = StreamWriter::create(&mut ctx, "trickle").unwrap();
        let total = w.write_all_from(&mut ctx, &mut Trickle(&input)).unwrap();
        w.finish(&mut ctx).unwrap();

        assert_eq!(total.bytes, 100);
        assert_eq!(total.blocks, 7);
        let manifest = std::fs::read(ctx.config.manifest_path("trickle").unwrap()).unwrap();
        let expected: Vec<u8> = dedup_types::block::digest_blocks(&input)
            .iter()
            .flat_map(|d| d.as_bytes().to_vec())
            .collect();
        assert_eq!(manifest, expected);
    }
}
