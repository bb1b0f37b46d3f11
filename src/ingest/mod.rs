// Bulk dump ingestion. The export is read line by line on a blocking thread
// (decompress, split, parse, batch) and handed to the async upsert loop over
// a small bounded channel, so memory stays at a couple of batches no matter
// how big the dump is.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::model::{HotelContent, PoiRecord, ReviewRecord};
use crate::store::{ContentStore, StoreError};
use crate::supplier::{DumpKind, SupplierClient, SupplierError};

pub mod transform;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Dump read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store write failed: {0}")]
    Store(#[from] StoreError),

    #[error("Dump download failed: {0}")]
    Supplier(#[from] SupplierError),

    #[error("Reader task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    // Where downloaded exports are kept between runs
    pub dump_dir: PathBuf,
    // POI and review exports are fetched once per language
    pub languages: Vec<String>,
    pub refresh_interval_seconds: u64,
    // Longer lines are counted as errors instead of being buffered
    pub max_line_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            dump_dir: PathBuf::from("./dumps"),
            languages: vec!["en".to_string()],
            refresh_interval_seconds: 24 * 3600,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Default)]
struct LineCounts {
    processed: usize,
    skipped: usize,
    errored: usize,
}

// A dump that can be read again from the start
#[derive(Debug, Clone)]
pub enum DumpSource {
    File(PathBuf),
    Memory(Bytes),
}

impl DumpSource {
    pub fn open(&self) -> Result<Box<dyn BufRead + Send>, IngestError> {
        let raw: Box<dyn Read + Send> = match self {
            DumpSource::File(path) => Box::new(File::open(path)?),
            DumpSource::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
        };
        let mut reader = BufReader::new(raw);

        let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
        // Exports may be several gzip members back to back
        if is_gzip {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
        } else {
            Ok(Box::new(reader))
        }
    }
}

// Record types the ingestor knows how to write
#[async_trait]
pub trait DumpRecord: Sized + Send + Sync + 'static {
    async fn upsert(store: &dyn ContentStore, batch: &[Self]) -> Result<usize, StoreError>;
}

#[async_trait]
impl DumpRecord for HotelContent {
    async fn upsert(store: &dyn ContentStore, batch: &[Self]) -> Result<usize, StoreError> {
        store.upsert_hotels(batch).await
    }
}

#[async_trait]
impl DumpRecord for PoiRecord {
    async fn upsert(store: &dyn ContentStore, batch: &[Self]) -> Result<usize, StoreError> {
        store.upsert_pois(batch).await
    }
}

#[async_trait]
impl DumpRecord for ReviewRecord {
    async fn upsert(store: &dyn ContentStore, batch: &[Self]) -> Result<usize, StoreError> {
        store.upsert_reviews(batch).await
    }
}

pub struct DumpIngestor {
    store: Arc<dyn ContentStore>,
    batch_size: usize,
    max_line_bytes: usize,
    // Newest dump version ingested per kind and language
    ingested_versions: Mutex<HashMap<(DumpKind, String), DateTime<Utc>>>,
}

impl DumpIngestor {
    pub fn new(store: Arc<dyn ContentStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            ingested_versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    pub async fn ingest<R, F>(
        &self,
        source: DumpSource,
        transform: F,
    ) -> Result<IngestReport, IngestError>
    where
        R: DumpRecord,
        F: Fn(&str) -> Result<Option<R>, String> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<R>>(2);
        let (batch_size, max_line_bytes) = (self.batch_size, self.max_line_bytes);
        let reader = tokio::task::spawn_blocking(move || {
            read_batches(&source, transform, batch_size, max_line_bytes, tx)
        });

        let mut imported = 0;
        let mut write_error = None;
        while let Some(batch) = rx.recv().await {
            match R::upsert(self.store.as_ref(), &batch).await {
                Ok(written) => {
                    imported += written;
                    debug!(written, imported, "dump batch upserted");
                }
                Err(e) => {
                    write_error = Some(e);
                    break;
                }
            }
        }
        // Unblocks the reader if it is waiting on a full channel
        drop(rx);

        let counts = reader
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))??;
        if let Some(e) = write_error {
            return Err(e.into());
        }

        let report = IngestReport {
            processed: counts.processed,
            imported,
            skipped: counts.skipped,
            errored: counts.errored,
        };
        if report.errored > 0 {
            warn!(errored = report.errored, processed = report.processed, "dump lines rejected");
        }
        info!(?report, "dump ingested");
        Ok(report)
    }

    // Downloads and ingests the supplier's current export unless that
    // version was already ingested. Returns None when nothing changed.
    #[instrument(skip(self, supplier, dir))]
    pub async fn refresh(
        &self,
        supplier: &dyn SupplierClient,
        kind: DumpKind,
        language: &str,
        dir: &Path,
    ) -> Result<Option<IngestReport>, IngestError> {
        let location = supplier.bulk_dump(kind, language).await?;
        let version_key = (kind, language.to_ascii_lowercase());

        let last = self.ingested_versions.lock().get(&version_key).copied();
        if last.is_some_and(|seen| location.last_update <= seen) {
            debug!(last_update = %location.last_update, "dump unchanged");
            return Ok(None);
        }

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}.jsonl.gz", kind, version_key.1));
        let bytes = supplier.download(&location.url, &path).await?;
        info!(bytes, path = %path.display(), "dump downloaded");

        let source = DumpSource::File(path);
        let report = match kind {
            DumpKind::HotelContent => self.ingest(source, transform::hotel_content_line).await?,
            DumpKind::PointsOfInterest => {
                self.ingest(source, transform::poi_line(language)).await?
            }
            DumpKind::Reviews => self.ingest(source, transform::review_line(language)).await?,
        };

        self.ingested_versions
            .lock()
            .insert(version_key, location.last_update);
        Ok(Some(report))
    }
}

fn read_batches<R, F>(
    source: &DumpSource,
    transform: F,
    batch_size: usize,
    max_line_bytes: usize,
    tx: mpsc::Sender<Vec<R>>,
) -> Result<LineCounts, IngestError>
where
    F: Fn(&str) -> Result<Option<R>, String>,
{
    let mut reader = source.open()?;
    let mut counts = LineCounts::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let (read, too_long) = read_capped_line(&mut reader, &mut raw, max_line_bytes)?;
        if read == 0 {
            break;
        }
        counts.processed += 1;
        if too_long {
            counts.errored += 1;
            warn!(line = counts.processed, max_line_bytes, "dump line too long, dropped");
            continue;
        }

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                counts.errored += 1;
                debug!(line = counts.processed, error = %e, "dump line is not utf-8");
                continue;
            }
        };
        if line.is_empty() {
            counts.skipped += 1;
            continue;
        }

        match transform(line) {
            Ok(Some(record)) => batch.push(record),
            Ok(None) => counts.skipped += 1,
            Err(e) => {
                counts.errored += 1;
                debug!(line = counts.processed, error = %e, "dump line rejected");
            }
        }

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.blocking_send(full).is_err() {
                // Writer gave up, its error is reported by the caller
                return Ok(counts);
            }
        }
    }

    if !batch.is_empty() {
        let _ = tx.blocking_send(batch);
    }
    Ok(counts)
}

// Reads one line into `buf` holding at most `cap + 1` bytes of it. Returns
// the bytes consumed and whether the line was longer than `cap`, in which
// case the rest of it is discarded and `buf` is left empty.
fn read_capped_line<B: BufRead + ?Sized>(
    reader: &mut B,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<(usize, bool)> {
    let mut consumed = (&mut *reader).take(cap as u64 + 1).read_until(b'\n', buf)?;
    if buf.len() <= cap || buf.last() == Some(&b'\n') {
        return Ok((consumed, false));
    }

    buf.clear();
    let mut rest = Vec::new();
    loop {
        rest.clear();
        let read = (&mut *reader).take(64 * 1024).read_until(b'\n', &mut rest)?;
        consumed += read;
        if read == 0 || rest.last() == Some(&b'\n') {
            return Ok((consumed, true));
        }
    }
}
