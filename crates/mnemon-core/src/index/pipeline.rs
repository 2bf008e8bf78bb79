//! Streaming indexing pipeline
//!
//! Five bounded stages with backpressure:
//!
//! ```text
//! Scanner → Reader (work-stealing pool) → Parser (CPU pool) → Embedder → Writer
//! ```
//!
//! Every channel carries a tagged message type with an explicit `Done`
//! variant; each stage's `Done` propagates downstream only after its own
//! upstream `Done` was observed and in-flight work drained. A watcher may
//! inject files directly into the reader stage or write operations directly
//! into the writer.
//!
//! Per-file chunk order is preserved end-to-end: the embedder assembles a
//! file's chunks completely (in index order) before handing it to the
//! writer, even when embedding batches straddle files. Across files the
//! pipeline is order-agnostic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dedup::{content_hash, fnv1a64};
use crate::embeddings::EmbeddingService;
use crate::storage::{ChunkRow, ProcessedFileRow, StorageError, Store, WriteBatchOp};

use super::chunker::{chunk_file, CodeChunk};
use super::language::is_code_language;
use super::rate_limit::RateLimiter;
use super::scanner::ScannedFile;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Chunks whose estimated tokens exceed this are truncated before dispatch
const MAX_EMBED_TOKENS: usize = 8000;

/// Retry bound for refundable embedding failures
const MAX_EMBED_ATTEMPTS: u32 = 3;

/// Base backoff between embedding retries
const EMBED_BACKOFF: Duration = Duration::from_millis(100);

/// Pipeline stage tuning. Two presets; `auto` picks by batch size.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Scanner → Reader buffer (file descriptors)
    pub scanner_buffer: usize,
    /// Reader → Parser buffer (file contents)
    pub reader_buffer: usize,
    /// Parser → Embedder buffer (chunked files)
    pub parser_buffer: usize,
    /// Embedder → Writer buffer (processed files)
    pub writer_buffer: usize,
    /// Texts per embedding request
    pub embed_batch_size: usize,
    /// Max wait before flushing an incomplete embedding batch
    pub embed_batch_timeout: Duration,
    /// Chunks accumulated before a writer flush
    pub write_flush_chunks: usize,
    /// Max wait before a writer flush
    pub write_flush_timeout: Duration,
    /// I/O-bound reader workers
    pub reader_workers: usize,
    /// CPU-bound parser workers
    pub parser_workers: usize,
}

impl PipelineConfig {
    /// Startup scans and full reindexes: large buffers, max throughput
    pub fn bulk() -> Self {
        Self {
            scanner_buffer: 256,
            reader_buffer: 128,
            parser_buffer: 256,
            writer_buffer: 64,
            embed_batch_size: 64,
            embed_batch_timeout: Duration::from_millis(50),
            write_flush_chunks: 500,
            write_flush_timeout: Duration::from_secs(1),
            reader_workers: 16,
            parser_workers: num_cpus::get().max(1),
        }
    }

    /// Watcher updates: small buffers, low latency
    pub fn incremental() -> Self {
        Self {
            scanner_buffer: 16,
            reader_buffer: 8,
            parser_buffer: 32,
            writer_buffer: 8,
            embed_batch_size: 16,
            embed_batch_timeout: Duration::from_millis(10),
            write_flush_chunks: 50,
            write_flush_timeout: Duration::from_millis(100),
            reader_workers: 4,
            parser_workers: num_cpus::get().clamp(1, 4),
        }
    }

    /// Select a preset from the batch size (>100 files is bulk)
    pub fn auto(file_count: usize) -> Self {
        if file_count > 100 {
            Self::bulk()
        } else {
            Self::incremental()
        }
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// A file entering the pipeline
#[derive(Debug, Clone)]
pub struct PipelineFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub language: String,
    /// Seconds since the epoch
    pub mtime: i64,
    /// Prior content, when the watcher has it cached; identical content
    /// short-circuits the parser
    pub old_content: Option<String>,
}

impl From<ScannedFile> for PipelineFile {
    fn from(file: ScannedFile) -> Self {
        Self {
            path: file.path,
            relative_path: file.relative_path,
            language: file.language,
            mtime: file.mtime,
            old_content: None,
        }
    }
}

/// Scanner → Reader
#[derive(Debug)]
pub enum ScanMessage {
    File(PipelineFile),
    Done,
}

/// Reader → Parser
enum ReadMessage {
    Content { file: PipelineFile, content: String },
    Done,
}

/// Parser → Embedder
enum ParseMessage {
    Chunks(Box<ParsedFile>),
    Done,
}

struct ParsedFile {
    file: PipelineFile,
    content: String,
    chunks: Vec<CodeChunk>,
    cache_keys: Vec<String>,
    /// Reused vectors keyed by chunk index
    existing: HashMap<usize, Vec<f32>>,
    /// Chunk indices that still need embedding
    needs_embedding: Vec<usize>,
}

/// Embedder → Writer. Also the watcher's direct-injection surface.
#[derive(Debug)]
pub enum WriteMessage {
    Upsert(ProcessedFileRow),
    Delete { path: String },
    Done,
}

/// Advisory progress events; dropped when the receiver lags
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    FileRead { path: String },
    FileChunked { path: String, chunks: usize },
    BatchEmbedded { size: usize },
    Flushed { operations: usize },
    FileError { path: String, error: String },
}

// ============================================================================
// RESULT / ERROR
// ============================================================================

/// Aggregate outcome of a pipeline run
#[derive(Debug, Default, Clone)]
pub struct PipelineResult {
    pub files_written: usize,
    pub files_deleted: usize,
    pub chunks_written: usize,
    pub chunks_embedded: usize,
    pub embed_batches: usize,
    pub write_flushes: usize,
    /// Per-file errors; these never fail the run
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Pipeline error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Pipeline stage panicked: {0}")]
    Join(String),
}

/// Pipeline result type
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// SHARED STATE
// ============================================================================

/// Cache key of a chunk: language + content hash. Identical chunks reuse
/// their stored vector instead of re-embedding.
pub fn chunk_cache_key(language: &str, content: &str) -> String {
    let mut bytes = Vec::with_capacity(language.len() + 1 + content.len());
    bytes.extend_from_slice(language.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(content.as_bytes());
    format!("{:016x}", fnv1a64(&bytes))
}

struct Shared {
    store: Arc<Store>,
    embeddings: Option<Arc<EmbeddingService>>,
    limiter: Arc<RateLimiter>,
    project_id: String,
    model_id: Option<String>,
    dimensions: usize,
    reuse_embeddings: bool,
    errors: StdMutex<Vec<String>>,
    chunks_embedded: AtomicUsize,
    embed_batches: AtomicUsize,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl Shared {
    fn record_error(&self, path: &str, error: impl std::fmt::Display) {
        let message = format!("{}: {}", path, error);
        tracing::warn!(path, error = %error.to_string(), "Pipeline file error");
        self.emit(ProgressEvent::FileError {
            path: path.to_string(),
            error: error.to_string(),
        });
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message);
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(event);
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Pipeline factory: dependencies + tuning
pub struct Pipeline {
    pub store: Arc<Store>,
    pub embeddings: Option<Arc<EmbeddingService>>,
    pub limiter: Arc<RateLimiter>,
    pub project_id: String,
    pub config: PipelineConfig,
    /// Reuse stored chunk vectors by cache key (code indexing on, document
    /// ingestion off)
    pub reuse_embeddings: bool,
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
    pub cancel: CancellationToken,
}

/// A started pipeline: feed it, then `finish`
pub struct RunningPipeline {
    input: mpsc::Sender<ScanMessage>,
    writer_input: mpsc::Sender<WriteMessage>,
    result: tokio::task::JoinHandle<Result<PipelineResult>>,
}

impl RunningPipeline {
    /// Inject a file into the reader stage. Blocks under backpressure.
    /// Returns false once the pipeline has shut down.
    pub async fn send_file(&self, file: PipelineFile) -> bool {
        self.input.send(ScanMessage::File(file)).await.is_ok()
    }

    /// Bypass straight to the writer: targeted delete by relative path
    pub async fn delete_path(&self, path: String) -> bool {
        self.writer_input
            .send(WriteMessage::Delete { path })
            .await
            .is_ok()
    }

    /// Handle for external injection into the reader stage
    pub fn input(&self) -> mpsc::Sender<ScanMessage> {
        self.input.clone()
    }

    /// Handle for external injection straight into the writer stage
    pub fn writer_input(&self) -> mpsc::Sender<WriteMessage> {
        self.writer_input.clone()
    }

    /// Signal end of input and wait for all stages to drain
    pub async fn finish(self) -> Result<PipelineResult> {
        let RunningPipeline { input, writer_input, result } = self;
        let _ = input.send(ScanMessage::Done).await;
        drop(input);
        drop(writer_input);
        result.await.map_err(|e| PipelineError::Join(e.to_string()))?
    }
}

impl Pipeline {
    /// Run the pipeline over a fixed file list
    pub async fn run(self, files: Vec<PipelineFile>) -> Result<PipelineResult> {
        let running = self.start();
        for file in files {
            if !running.send_file(file).await {
                break;
            }
        }
        running.finish().await
    }

    /// Start all stages and return the injection handles
    pub fn start(self) -> RunningPipeline {
        let Pipeline {
            store,
            embeddings,
            limiter,
            project_id,
            config,
            reuse_embeddings,
            progress,
            cancel,
        } = self;

        let (model_id, dimensions) = match &embeddings {
            Some(service) => (
                Some(service.get_active_model_id()),
                service.dimensions(),
            ),
            None => (None, 0),
        };

        let shared = Arc::new(Shared {
            store,
            embeddings,
            limiter,
            project_id,
            model_id,
            dimensions,
            reuse_embeddings,
            errors: StdMutex::new(Vec::new()),
            chunks_embedded: AtomicUsize::new(0),
            embed_batches: AtomicUsize::new(0),
            progress,
            cancel,
        });

        let (scan_tx, scan_rx) = mpsc::channel::<ScanMessage>(config.scanner_buffer);
        let (content_tx, content_rx) = mpsc::channel::<ReadMessage>(config.reader_buffer);
        let (parsed_tx, parsed_rx) = mpsc::channel::<ParseMessage>(config.parser_buffer);
        let (write_tx, write_rx) = mpsc::channel::<WriteMessage>(config.writer_buffer);

        tokio::spawn(reader_stage(
            shared.clone(),
            config.reader_workers,
            scan_rx,
            scan_tx.clone(),
            content_tx,
        ));
        tokio::spawn(parser_stage(
            shared.clone(),
            config.parser_workers,
            content_rx,
            parsed_tx,
        ));
        tokio::spawn(embedder_stage(
            shared.clone(),
            config.clone(),
            parsed_rx,
            write_tx.clone(),
        ));
        let writer = tokio::spawn(writer_stage(shared.clone(), config, write_rx));

        let result = tokio::spawn(async move {
            let mut result = writer
                .await
                .map_err(|e| PipelineError::Join(e.to_string()))??;
            result.chunks_embedded = shared.chunks_embedded.load(Ordering::SeqCst);
            result.embed_batches = shared.embed_batches.load(Ordering::SeqCst);
            result.errors = shared
                .errors
                .lock()
                .map(|e| e.clone())
                .unwrap_or_default();
            result.cancelled = shared.cancel.is_cancelled();
            Ok(result)
        });

        RunningPipeline {
            input: scan_tx,
            writer_input: write_tx,
            result,
        }
    }
}

// ============================================================================
// READER STAGE
// ============================================================================

/// I/O-bound pool sharing one receiver behind a mutex (work stealing).
///
/// A worker that consumes `Done` re-queues it before exiting so its
/// siblings also drain, even while external injectors (the watcher) still
/// hold a sender clone.
async fn reader_stage(
    shared: Arc<Shared>,
    workers: usize,
    input: mpsc::Receiver<ScanMessage>,
    requeue: mpsc::Sender<ScanMessage>,
    output: mpsc::Sender<ReadMessage>,
) {
    let input = Arc::new(tokio::sync::Mutex::new(input));
    let mut pool = JoinSet::new();

    for _ in 0..workers.max(1) {
        let shared = shared.clone();
        let input = input.clone();
        let requeue = requeue.clone();
        let output = output.clone();
        pool.spawn(async move {
            loop {
                if shared.cancel.is_cancelled() {
                    break;
                }
                let message = { input.lock().await.recv().await };
                match message {
                    Some(ScanMessage::File(file)) => {
                        match tokio::fs::read_to_string(&file.path).await {
                            Ok(content) => {
                                shared.emit(ProgressEvent::FileRead {
                                    path: file.relative_path.clone(),
                                });
                                if output
                                    .send(ReadMessage::Content { file, content })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => shared.record_error(&file.relative_path, e),
                        }
                    }
                    Some(ScanMessage::Done) => {
                        let _ = requeue.send(ScanMessage::Done).await;
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    while pool.join_next().await.is_some() {}
    let _ = output.send(ReadMessage::Done).await;
}

// ============================================================================
// PARSER STAGE
// ============================================================================

/// CPU-bound pool: chunk, compute cache keys, look up reusable embeddings
async fn parser_stage(
    shared: Arc<Shared>,
    workers: usize,
    input: mpsc::Receiver<ReadMessage>,
    output: mpsc::Sender<ParseMessage>,
) {
    let input = Arc::new(tokio::sync::Mutex::new(input));
    let mut pool = JoinSet::new();

    for _ in 0..workers.max(1) {
        let shared = shared.clone();
        let input = input.clone();
        let output = output.clone();
        pool.spawn(async move {
            loop {
                if shared.cancel.is_cancelled() {
                    break;
                }
                let message = { input.lock().await.recv().await };
                match message {
                    Some(ReadMessage::Content { file, content }) => {
                        // Unchanged content from the watcher cache is a no-op
                        if file.old_content.as_deref() == Some(content.as_str()) {
                            continue;
                        }

                        let chunks = chunk_file(&content, &file.language);
                        if chunks.is_empty() {
                            continue;
                        }

                        let cache_keys: Vec<String> = chunks
                            .iter()
                            .map(|c| chunk_cache_key(&file.language, &c.content))
                            .collect();

                        let existing = match (&shared.model_id, shared.reuse_embeddings) {
                            (Some(model_id), true) => {
                                match shared.store.embeddings_by_cache_keys(
                                    &cache_keys,
                                    model_id,
                                    shared.dimensions,
                                ) {
                                    Ok(by_key) => cache_keys
                                        .iter()
                                        .enumerate()
                                        .filter_map(|(i, key)| {
                                            by_key.get(key).map(|v| (i, v.clone()))
                                        })
                                        .collect(),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Embedding reuse lookup failed");
                                        HashMap::new()
                                    }
                                }
                            }
                            _ => HashMap::new(),
                        };

                        let needs_embedding: Vec<usize> = match &shared.model_id {
                            Some(_) => (0..chunks.len())
                                .filter(|i| !existing.contains_key(i))
                                .collect(),
                            None => Vec::new(),
                        };

                        shared.emit(ProgressEvent::FileChunked {
                            path: file.relative_path.clone(),
                            chunks: chunks.len(),
                        });

                        let parsed = ParsedFile {
                            file,
                            content,
                            chunks,
                            cache_keys,
                            existing,
                            needs_embedding,
                        };
                        if output
                            .send(ParseMessage::Chunks(Box::new(parsed)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(ReadMessage::Done) | None => break,
                }
            }
        });
    }

    while pool.join_next().await.is_some() {}
    let _ = output.send(ParseMessage::Done).await;
}

// ============================================================================
// EMBEDDER STAGE
// ============================================================================

struct PendingFile {
    parsed: ParsedFile,
    vectors: Vec<Option<Vec<f32>>>,
    remaining: usize,
}

#[derive(Clone)]
struct BatchItem {
    file_seq: u64,
    chunk_index: usize,
    text: String,
}

type Registry = Arc<StdMutex<HashMap<u64, PendingFile>>>;

/// Accumulates chunks needing embedding and fires concurrent batches. A
/// batch fires when it reaches the configured size, when the oldest queued
/// chunk exceeds the batch timeout, or when input ends. Files are handed to
/// the writer only once every chunk has a vector, preserving chunk order.
async fn embedder_stage(
    shared: Arc<Shared>,
    config: PipelineConfig,
    mut input: mpsc::Receiver<ParseMessage>,
    output: mpsc::Sender<WriteMessage>,
) {
    let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut batch: Vec<BatchItem> = Vec::new();
    let mut batch_deadline: Option<tokio::time::Instant> = None;
    let mut next_seq: u64 = 0;

    loop {
        // Deadline is Copy; move a snapshot so branch bodies can reset it
        let timeout = async move {
            match batch_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            _ = timeout => {
                spawn_batch(&shared, &registry, &mut in_flight, std::mem::take(&mut batch), &output);
                batch_deadline = None;
            }

            message = input.recv() => {
                match message {
                    Some(ParseMessage::Chunks(parsed)) => {
                        let seq = next_seq;
                        next_seq += 1;

                        if parsed.needs_embedding.is_empty() {
                            // Nothing to embed: reuse hits and/or no provider
                            let row = assemble_row(&shared, *parsed, Vec::new());
                            if output.send(WriteMessage::Upsert(row)).await.is_err() {
                                break;
                            }
                            continue;
                        }

                        let texts: Vec<BatchItem> = parsed
                            .needs_embedding
                            .iter()
                            .map(|&i| BatchItem {
                                file_seq: seq,
                                chunk_index: i,
                                text: clip_for_embedding(&parsed.chunks[i].content),
                            })
                            .collect();

                        {
                            let remaining = parsed.needs_embedding.len();
                            let vectors = vec![None; parsed.chunks.len()];
                            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                            registry.insert(seq, PendingFile { parsed: *parsed, vectors, remaining });
                        }

                        for item in texts {
                            batch.push(item);
                            if batch.len() >= config.embed_batch_size {
                                spawn_batch(&shared, &registry, &mut in_flight, std::mem::take(&mut batch), &output);
                                batch_deadline = None;
                            }
                        }
                        if !batch.is_empty() && batch_deadline.is_none() {
                            batch_deadline = Some(tokio::time::Instant::now() + config.embed_batch_timeout);
                        }
                    }
                    Some(ParseMessage::Done) | None => break,
                }
            }
        }
    }

    // End of input (or cancellation): flush the partial batch, then wait for
    // every in-flight batch before signalling Done downstream
    spawn_batch(&shared, &registry, &mut in_flight, std::mem::take(&mut batch), &output);
    while in_flight.join_next().await.is_some() {}

    // Anything still pending lost its batch to cancellation: degrade to
    // zero vectors so the files are indexed anyway
    let leftovers: Vec<PendingFile> = {
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.drain().map(|(_, pending)| pending).collect()
    };
    for mut pending in leftovers {
        for slot in pending.vectors.iter_mut() {
            if slot.is_none() {
                *slot = Some(vec![0.0; shared.dimensions]);
            }
        }
        let vectors = std::mem::take(&mut pending.vectors);
        let row = assemble_row(&shared, pending.parsed, vectors);
        if output.send(WriteMessage::Upsert(row)).await.is_err() {
            break;
        }
    }

    let _ = output.send(WriteMessage::Done).await;
}

/// Truncate oversized chunk text before dispatch
fn clip_for_embedding(text: &str) -> String {
    let max_chars = MAX_EMBED_TOKENS * super::chunker::CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn spawn_batch(
    shared: &Arc<Shared>,
    registry: &Registry,
    in_flight: &mut JoinSet<()>,
    batch: Vec<BatchItem>,
    output: &mpsc::Sender<WriteMessage>,
) {
    if batch.is_empty() {
        return;
    }
    let shared = shared.clone();
    let registry = registry.clone();
    let output = output.clone();
    in_flight.spawn(async move {
        let vectors = embed_with_retry(&shared, &batch).await;
        shared
            .chunks_embedded
            .fetch_add(vectors.len(), Ordering::SeqCst);
        shared.emit(ProgressEvent::BatchEmbedded { size: vectors.len() });
        deliver(&shared, &registry, batch, vectors, &output).await;
    });
}

/// One rate-limited embedding request with bounded retries. Refundable
/// failures return the token and back off exponentially; non-refundable
/// failures spend it. Terminal failure degrades to zero vectors so the
/// files are still indexed.
async fn embed_with_retry(shared: &Shared, batch: &[BatchItem]) -> Vec<Vec<f32>> {
    let service = shared
        .embeddings
        .as_ref()
        .expect("embedder batches only exist with a provider");
    let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();

    for attempt in 0..MAX_EMBED_ATTEMPTS {
        shared.limiter.acquire().await;
        shared.embed_batches.fetch_add(1, Ordering::SeqCst);

        match service.embed_batch(&texts).await {
            Ok((vectors, _meta)) if vectors.len() == texts.len() => return vectors,
            Ok((vectors, _meta)) => {
                tracing::warn!(
                    expected = texts.len(),
                    got = vectors.len(),
                    "Ragged embedding batch; degrading to zero vectors"
                );
                break;
            }
            Err(e) => {
                if e.is_refundable() {
                    shared.limiter.refund();
                    if attempt + 1 < MAX_EMBED_ATTEMPTS {
                        let backoff = EMBED_BACKOFF * 2u32.pow(attempt);
                        tracing::debug!(error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "Refundable embedding failure; retrying");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                }
                tracing::warn!(error = %e, "Embedding batch failed terminally; degrading to zero vectors");
                break;
            }
        }
    }

    vec![vec![0.0; shared.dimensions]; texts.len()]
}

/// Fill vector slots; files whose last chunk arrived are assembled and sent
async fn deliver(
    shared: &Shared,
    registry: &Registry,
    batch: Vec<BatchItem>,
    vectors: Vec<Vec<f32>>,
    output: &mpsc::Sender<WriteMessage>,
) {
    let mut completed: Vec<PendingFile> = Vec::new();
    {
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        for (item, vector) in batch.into_iter().zip(vectors) {
            let Some(pending) = registry.get_mut(&item.file_seq) else {
                continue;
            };
            if pending.vectors[item.chunk_index].is_none() {
                pending.vectors[item.chunk_index] = Some(vector);
                pending.remaining -= 1;
            }
            if pending.remaining == 0 {
                if let Some(pending) = registry.remove(&item.file_seq) {
                    completed.push(pending);
                }
            }
        }
    }

    for mut pending in completed {
        let vectors = std::mem::take(&mut pending.vectors);
        let row = assemble_row(shared, pending.parsed, vectors);
        let _ = output.send(WriteMessage::Upsert(row)).await;
    }
}

/// Build the writer row, merging freshly embedded vectors with reuse hits.
/// Chunks keep their file order; `chunk_index` is authoritative.
fn assemble_row(
    shared: &Shared,
    parsed: ParsedFile,
    mut fresh_vectors: Vec<Option<Vec<f32>>>,
) -> ProcessedFileRow {
    let ParsedFile {
        file,
        content,
        chunks,
        cache_keys,
        mut existing,
        ..
    } = parsed;

    fresh_vectors.resize(chunks.len(), None);

    let chunk_rows: Vec<ChunkRow> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let vector = match (&shared.model_id, fresh_vectors[i].take(), existing.remove(&i)) {
                (Some(model_id), Some(fresh), _) => Some((model_id.clone(), fresh)),
                (Some(model_id), None, Some(reused)) => Some((model_id.clone(), reused)),
                _ => None,
            };
            ChunkRow {
                chunk_index: i,
                content: chunk.content,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                chunk_type: chunk.chunk_type.as_str().to_string(),
                symbols: chunk.symbols,
                tokens_estimate: chunk.tokens_estimate,
                cache_key: cache_keys[i].clone(),
                vector,
            }
        })
        .collect();

    ProcessedFileRow {
        path: file.relative_path,
        language: Some(file.language.clone()),
        line_count: content.lines().count(),
        checksum: content_hash(&content),
        is_code: is_code_language(&file.language),
        full_content: content,
        mtime: file.mtime,
        chunks: chunk_rows,
    }
}

// ============================================================================
// WRITER STAGE
// ============================================================================

/// Single writer: accumulates operations and lands each flush in one
/// transaction, on chunk-count or time threshold.
async fn writer_stage(
    shared: Arc<Shared>,
    config: PipelineConfig,
    mut input: mpsc::Receiver<WriteMessage>,
) -> Result<PipelineResult> {
    let mut result = PipelineResult::default();
    let mut buffer: Vec<WriteBatchOp> = Vec::new();
    let mut buffered_chunks = 0usize;
    let mut deadline: Option<tokio::time::Instant> = None;

    let mut flush = |buffer: &mut Vec<WriteBatchOp>,
                     buffered_chunks: &mut usize,
                     result: &mut PipelineResult| {
        if buffer.is_empty() {
            return;
        }
        let operations = std::mem::take(buffer);
        let count = operations.len();
        match shared.store.apply_write_batch(&shared.project_id, &operations) {
            Ok(()) => {
                result.write_flushes += 1;
                for op in &operations {
                    match op {
                        WriteBatchOp::UpsertFile(file) => {
                            result.files_written += 1;
                            result.chunks_written += file.chunks.len();
                        }
                        WriteBatchOp::DeleteFile { .. } => result.files_deleted += 1,
                    }
                }
                shared.emit(ProgressEvent::Flushed { operations: count });
            }
            Err(e) => {
                tracing::error!(error = %e, operations = count, "Writer flush failed");
                if let Ok(mut errors) = shared.errors.lock() {
                    errors.push(format!("writer flush of {} operations: {}", count, e));
                }
            }
        }
        *buffered_chunks = 0;
    };

    loop {
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = timeout => {
                flush(&mut buffer, &mut buffered_chunks, &mut result);
                deadline = None;
            }

            message = input.recv() => {
                match message {
                    Some(WriteMessage::Upsert(row)) => {
                        buffered_chunks += row.chunks.len();
                        buffer.push(WriteBatchOp::UpsertFile(row));
                        if buffered_chunks >= config.write_flush_chunks {
                            flush(&mut buffer, &mut buffered_chunks, &mut result);
                            deadline = None;
                        } else if deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + config.write_flush_timeout);
                        }
                    }
                    Some(WriteMessage::Delete { path }) => {
                        buffer.push(WriteBatchOp::DeleteFile { path });
                        if deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + config.write_flush_timeout);
                        }
                    }
                    Some(WriteMessage::Done) | None => {
                        flush(&mut buffer, &mut buffered_chunks, &mut result);
                        break;
                    }
                }
            }
        }
    }

    Ok(result)
}

// ============================================================================
// TESTS
// ============================================================================
