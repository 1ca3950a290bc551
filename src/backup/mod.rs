//! Streaming snapshots of the key-value layer: batched `{key: value}` chunk
//! frames inside a tar archive, optionally gzip-compressed, finished with a
//! `metadata.json` document that marks the archive valid.
//!
//! Archive I/O is blocking (tar + flate2), so it runs on the blocking pool
//! behind a frame channel while the async side drives the backend scan.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::repo::DataStore;

const ARCHIVE_VERSION: &str = "1.0";
const METADATA_FRAME: &str = "metadata.json";
const CHUNK_SUFFIX: &str = ".chunk";

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    /// gzip level in `0..=9`; 0 writes a plain tar.
    pub compression_level: u32,
    /// Records per chunk frame.
    pub chunk_size: usize,
    /// Wall-clock bound for a whole create/restore/verify call.
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Re-open and verify the archive after writing it.
    pub verify_integrity: bool,
    /// Write the trailing metadata document. Disabling this produces an
    /// archive that restore and verify will reject.
    pub include_metadata: bool,
    /// Glob patterns matched against the key; matches are skipped.
    pub exclude_patterns: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            compression_level: 6,
            chunk_size: 1000,
            timeout: None,
            verify_integrity: false,
            include_metadata: true,
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub duration_ns: u64,
    pub keys_processed: u64,
    pub bytes_processed: u64,
    pub bytes_compressed: u64,
    pub compression_ratio: f64,
    pub error_count: u64,
    pub skipped_keys: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatastoreInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub key_encoding: String,
    pub value_encoding: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub total_keys: u64,
    pub total_size: u64,
    pub compression: String,
    pub config: BackupConfig,
    pub statistics: BackupStatistics,
    pub datastore_info: DatastoreInfo,
}

enum Frame {
    Data(String, Vec<u8>),
    /// Flush and report the bytes written to the underlying file so far.
    Measure(oneshot::Sender<u64>),
}

#[derive(Clone, Debug, Default)]
pub struct BackupEngine {
    config: BackupConfig,
}

impl BackupEngine {
    pub fn new(config: BackupConfig) -> Self {
        BackupEngine { config }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Snapshots `src` into a fresh archive at `output`. A failed run leaves
    /// a partial file behind that the caller is expected to discard.
    pub async fn create_backup(
        &self,
        ctx: &CancellationToken,
        src: &Arc<dyn DataStore>,
        output: &Path,
    ) -> Result<BackupMetadata> {
        let metadata = self
            .bounded(self.create_inner(ctx, src, output))
            .await?;

        if self.config.verify_integrity {
            self.verify_backup(ctx, output).await?;
        }
        Ok(metadata)
    }

    /// Replays every chunk of `input` into `dst` with overwrite semantics.
    /// Cancellation aborts between frames; already-restored keys stay.
    pub async fn restore_backup(
        &self,
        ctx: &CancellationToken,
        input: &Path,
        dst: &Arc<dyn DataStore>,
    ) -> Result<BackupMetadata> {
        self.bounded(read_archive(ctx, input, Some(dst.clone())))
            .await
    }

    /// Fully parses every frame without writing anywhere; the archive is
    /// valid iff every chunk decodes and a metadata document is present.
    pub async fn verify_backup(
        &self,
        ctx: &CancellationToken,
        input: &Path,
    ) -> Result<BackupMetadata> {
        self.bounded(read_archive(ctx, input, None)).await
    }

    async fn bounded<F>(&self, fut: F) -> Result<BackupMetadata>
    where
        F: std::future::Future<Output = Result<BackupMetadata>>,
    {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout)?,
            None => fut.await,
        }
    }

    async fn create_inner(
        &self,
        ctx: &CancellationToken,
        src: &Arc<dyn DataStore>,
        output: &Path,
    ) -> Result<BackupMetadata> {
        let started = std::time::Instant::now();

        let patterns = compile_patterns(&self.config.exclude_patterns)?;

        let (tx, rx) = mpsc::channel::<Frame>(4);
        let writer = spawn_writer(output.to_path_buf(), self.config.compression_level, rx);

        let mut stats = BackupStatistics::default();
        let mut chunk: BTreeMap<String, String> = BTreeMap::new();
        let mut chunk_index = 0usize;

        let mut entries = src.scan(&[]).await;
        let result: Result<()> = loop {
            if ctx.is_cancelled() {
                break Err(Error::Cancelled);
            }
            let (key, value) = match entries.next().await {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            let key = match String::from_utf8(key) {
                Ok(key) => key,
                Err(_) => {
                    warn!("skipping non-utf8 key in backup scan");
                    stats.error_count += 1;
                    continue;
                }
            };

            if patterns.iter().any(|p| p.matches(&key)) {
                stats.skipped_keys += 1;
                continue;
            }

            stats.keys_processed += 1;
            stats.bytes_processed += value.len() as u64;
            chunk.insert(key, b64().encode(value));

            if chunk.len() >= self.config.chunk_size {
                send_chunk(&tx, chunk_index, std::mem::take(&mut chunk)).await?;
                chunk_index += 1;
            }
        };

        if let Err(e) = result {
            drop(tx);
            let _ = writer.await;
            return Err(e);
        }

        if !chunk.is_empty() {
            send_chunk(&tx, chunk_index, std::mem::take(&mut chunk)).await?;
        }

        // measure compressed output before the metadata frame so the
        // document can report it
        let (measure_tx, measure_rx) = oneshot::channel();
        tx.send(Frame::Measure(measure_tx))
            .await
            .map_err(|_| Error::WriteFailed("archive writer stopped".into()))?;
        stats.bytes_compressed = measure_rx
            .await
            .map_err(|_| Error::WriteFailed("archive writer stopped".into()))?;
        stats.compression_ratio = if stats.bytes_processed > 0 {
            stats.bytes_compressed as f64 / stats.bytes_processed as f64
        } else {
            0.0
        };
        stats.duration_ns = started.elapsed().as_nanos() as u64;

        let metadata = BackupMetadata {
            version: ARCHIVE_VERSION.into(),
            timestamp: Utc::now(),
            total_keys: stats.keys_processed,
            total_size: stats.bytes_processed,
            compression: compression_label(self.config.compression_level),
            config: self.config.clone(),
            statistics: stats,
            datastore_info: DatastoreInfo {
                kind: src.kind().into(),
                key_encoding: "utf-8".into(),
                value_encoding: "base64".into(),
            },
        };

        if self.config.include_metadata {
            let body = serde_json::to_vec_pretty(&metadata)?;
            tx.send(Frame::Data(METADATA_FRAME.into(), body))
                .await
                .map_err(|_| Error::WriteFailed("archive writer stopped".into()))?;
        }

        drop(tx);
        writer
            .await
            .map_err(Error::backend)??;

        debug!(
            "backup of {} keys ({} bytes) written to {}",
            metadata.total_keys,
            metadata.total_size,
            output.display()
        );
        Ok(metadata)
    }
}

fn compression_label(level: u32) -> String {
    if level == 0 {
        "none".into()
    } else {
        format!("gzip-{level}")
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| Error::Backend(anyhow::anyhow!("invalid exclude pattern {p:?}: {e}")))
        })
        .collect()
}

async fn send_chunk(
    tx: &mpsc::Sender<Frame>,
    index: usize,
    chunk: BTreeMap<String, String>,
) -> Result<()> {
    let body = serde_json::to_vec(&chunk)?;
    tx.send(Frame::Data(format!("chunk_{index}{CHUNK_SUFFIX}"), body))
        .await
        .map_err(|_| Error::WriteFailed("archive writer stopped".into()))
}

fn spawn_writer(
    path: PathBuf,
    level: u32,
    rx: mpsc::Receiver<Frame>,
) -> tokio::task::JoinHandle<Result<()>> {
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        let span = tracing::trace_span!(parent: &span, "blocking");
        let _g = span.enter();
        run_writer(&path, level, rx)
    })
}

fn run_writer(path: &Path, level: u32, mut rx: mpsc::Receiver<Frame>) -> Result<()> {
    let file = std::fs::File::create(path)?;

    if level > 0 {
        let encoder = GzEncoder::new(file, Compression::new(level.min(9)));
        let mut builder = tar::Builder::new(encoder);
        drain_frames(&mut builder, &mut rx)?;
        let mut encoder = builder.into_inner()?;
        encoder.try_finish()?;
        encoder.finish()?.sync_all()?;
    } else {
        let mut builder = tar::Builder::new(file);
        drain_frames(&mut builder, &mut rx)?;
        builder.into_inner()?.sync_all()?;
    }
    Ok(())
}

trait Measurable: Write {
    fn bytes_on_disk(&mut self) -> Result<u64>;
}

impl Measurable for std::fs::File {
    fn bytes_on_disk(&mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.metadata()?.len())
    }
}

impl Measurable for GzEncoder<std::fs::File> {
    fn bytes_on_disk(&mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.get_ref().metadata()?.len())
    }
}

fn drain_frames<W: Measurable>(
    builder: &mut tar::Builder<W>,
    rx: &mut mpsc::Receiver<Frame>,
) -> Result<()> {
    while let Some(frame) = rx.blocking_recv() {
        match frame {
            Frame::Data(name, body) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(0);
                builder.append_data(&mut header, name, body.as_slice())?;
            }
            Frame::Measure(reply) => {
                builder.get_mut().flush()?;
                let measured = builder.get_mut().bytes_on_disk()?;
                let _ = reply.send(measured);
            }
        }
    }
    Ok(())
}

fn open_archive(path: &Path) -> Result<Box<dyn Read + Send>> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Shared frame loop behind restore and verify. With a destination, chunk
/// records are written through with overwrite semantics; without one they
/// are only decoded.
async fn read_archive(
    ctx: &CancellationToken,
    input: &Path,
    dst: Option<Arc<dyn DataStore>>,
) -> Result<BackupMetadata> {
    let (tx, mut rx) = mpsc::channel::<Result<(String, Vec<u8>)>>(4);
    let reader = spawn_reader(input.to_path_buf(), tx);

    let mut metadata: Option<BackupMetadata> = None;

    while let Some(frame) = rx.recv().await {
        if ctx.is_cancelled() {
            drop(rx);
            let _ = reader.await;
            return Err(Error::Cancelled);
        }
        let (name, body) = frame?;

        if name == METADATA_FRAME {
            let doc = serde_json::from_slice(&body)
                .map_err(|e| Error::Corrupted(format!("metadata document: {e}")))?;
            metadata = Some(doc);
            continue;
        }

        if !name.ends_with(CHUNK_SUFFIX) {
            warn!("ignoring unknown archive frame {name:?}");
            continue;
        }

        let chunk: BTreeMap<String, String> = serde_json::from_slice(&body)
            .map_err(|e| Error::Corrupted(format!("chunk frame {name:?}: {e}")))?;

        let mut entries = Vec::with_capacity(chunk.len());
        for (key, value) in chunk {
            let value = b64()
                .decode(value)
                .map_err(|e| Error::Corrupted(format!("chunk frame {name:?}: {e}")))?;
            entries.push((key.into_bytes(), value));
        }

        if let Some(dst) = &dst {
            dst.batch_put(entries).await?;
        }
    }

    reader.await.map_err(Error::backend)??;

    metadata.ok_or(Error::MetadataMissing)
}

fn spawn_reader(
    path: PathBuf,
    tx: mpsc::Sender<Result<(String, Vec<u8>)>>,
) -> tokio::task::JoinHandle<Result<()>> {
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        let span = tracing::trace_span!(parent: &span, "blocking");
        let _g = span.enter();
        run_reader(&path, tx)
    })
}

fn run_reader(path: &Path, tx: mpsc::Sender<Result<(String, Vec<u8>)>>) -> Result<()> {
    let reader = open_archive(path)?;
    let mut archive = tar::Archive::new(reader);

    let entries = archive
        .entries()
        .map_err(|e| Error::Corrupted(format!("not a frame archive: {e}")))?;

    for entry in entries {
        let frame = (|| {
            let mut entry = entry.map_err(|e| Error::Corrupted(format!("frame header: {e}")))?;
            let name = entry
                .path()
                .map_err(|e| Error::Corrupted(format!("frame name: {e}")))?
                .to_string_lossy()
                .into_owned();
            let mut body = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut body)
                .map_err(|e| Error::Corrupted(format!("frame body {name:?}: {e}")))?;
            Ok((name, body))
        })();

        let failed = frame.is_err();
        if tx.blocking_send(frame).is_err() || failed {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemDataStore;
    use futures::TryStreamExt;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn seeded_store(entries: &[(&str, &[u8])]) -> Arc<dyn DataStore> {
        let store = MemDataStore::new();
        for (key, value) in entries {
            store.put(key.as_bytes(), value).await.unwrap();
        }
        Arc::new(store)
    }

    async fn store_contents(store: &Arc<dyn DataStore>) -> Vec<(String, Vec<u8>)> {
        store
            .scan(&[])
            .await
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, v)| (String::from_utf8(k).unwrap(), v))
            .collect()
    }

    #[tokio::test]
    async fn round_trip_restores_bytewise() {
        let src = seeded_store(&[
            ("/blocks/a", &b"alpha"[..]),
            ("/blocks/b", &[0u8, 159, 146, 150]),
            ("/local/z", &b""[..]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("snapshot.tar.gz");

        let engine = BackupEngine::new(BackupConfig {
            chunk_size: 2,
            verify_integrity: true,
            ..Default::default()
        });

        let metadata = engine.create_backup(&ctx(), &src, &archive).await.unwrap();
        assert_eq!(metadata.total_keys, 3);
        assert_eq!(metadata.compression, "gzip-6");
        assert!(metadata.statistics.bytes_compressed > 0);

        let dst: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
        let restored = engine.restore_backup(&ctx(), &archive, &dst).await.unwrap();
        assert_eq!(restored.total_keys, 3);

        assert_eq!(store_contents(&src).await, store_contents(&dst).await);

        // restore over an already-restored destination is a no-op overwrite
        engine.restore_backup(&ctx(), &archive, &dst).await.unwrap();
        assert_eq!(store_contents(&src).await, store_contents(&dst).await);
    }

    #[tokio::test]
    async fn uncompressed_archive_round_trips() {
        let src = seeded_store(&[("/k", &b"v"[..])]).await;
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plain.tar");

        let engine = BackupEngine::new(BackupConfig {
            compression_level: 0,
            ..Default::default()
        });
        let metadata = engine.create_backup(&ctx(), &src, &archive).await.unwrap();
        assert_eq!(metadata.compression, "none");

        let dst: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
        engine.restore_backup(&ctx(), &archive, &dst).await.unwrap();
        assert_eq!(dst.get(b"/k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn exclude_patterns_filter_keys() {
        let src = seeded_store(&[
            ("/blocks/a", &b"a"[..]),
            ("/blocks/b", &b"b"[..]),
            ("/temp/x", &b"x"[..]),
            ("/cache/y", &b"y"[..]),
            ("/local/z", &b"z"[..]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("filtered.tar.gz");

        let engine = BackupEngine::new(BackupConfig {
            exclude_patterns: vec!["/temp/*".into(), "/cache/*".into()],
            ..Default::default()
        });
        let metadata = engine.create_backup(&ctx(), &src, &archive).await.unwrap();
        assert_eq!(metadata.total_keys, 3);
        assert_eq!(metadata.statistics.skipped_keys, 2);

        let dst: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
        engine.restore_backup(&ctx(), &archive, &dst).await.unwrap();

        let keys: Vec<String> = store_contents(&dst)
            .await
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/blocks/a", "/blocks/b", "/local/z"]);
    }

    #[tokio::test]
    async fn garbage_input_is_corrupted_or_missing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tar");
        std::fs::write(&bogus, b"this is not an archive at all, not even close").unwrap();

        let engine = BackupEngine::default();
        let err = engine.verify_backup(&ctx(), &bogus).await.unwrap_err();
        assert!(
            matches!(err, Error::Corrupted(_) | Error::MetadataMissing),
            "unexpected: {err}"
        );
    }

    #[tokio::test]
    async fn archive_without_metadata_fails_restore() {
        let src = seeded_store(&[("/k", &b"v"[..])]).await;
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("headless.tar.gz");

        let engine = BackupEngine::new(BackupConfig {
            include_metadata: false,
            ..Default::default()
        });
        engine.create_backup(&ctx(), &src, &archive).await.unwrap();

        let dst: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
        let err = engine
            .restore_backup(&ctx(), &archive, &dst)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetadataMissing));
    }

    #[tokio::test]
    async fn cancelled_backup_aborts() {
        let src = seeded_store(&[("/k", &b"v"[..])]).await;
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("cancelled.tar.gz");

        let token = CancellationToken::new();
        token.cancel();

        let engine = BackupEngine::default();
        let err = engine
            .create_backup(&token, &src, &archive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
