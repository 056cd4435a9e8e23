//! Indexing orchestrator
//!
//! Drives the full ingest path in batches: read messages past the
//! persisted cursor, chunk, dedupe, enrich, embed, bulk-write, then
//! commit the chunk records and the new cursor. A batch is complete only
//! after its documents are written AND its records committed, so a crash
//! mid-batch re-reads the tail on the next run and the content-hash ids
//! make the rewrite benign.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::contacts::ContactResolver;
use crate::embedding::{create_text_embedder, TextEmbedder, VisionEmbedder};
use crate::error::Result;
use crate::graph::ChatGraph;
use crate::index::SearchIndex;
use crate::pipeline::{chunk_messages, dedup_chunks, enrich_chunk, ChunkerConfig};
use crate::reader::{AttachmentReader, MessageReader};
use crate::state::StateStore;
use crate::timeutil::now_unix;
use crate::types::{
    AppConfig, Chunk, ChunkRecord, IndexedDocument, IndexerStatus, RawMessage, StateUpdate,
};

/// Messages read per batch by default
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Options for one indexing run
#[derive(Debug, Clone)]
pub struct IndexRunOptions {
    /// Clear the state store and the index before reading
    pub full_reindex: bool,
    /// Stop after this many messages (testing / partial runs)
    pub max_messages: Option<usize>,
    pub batch_size: usize,
}

impl Default for IndexRunOptions {
    fn default() -> Self {
        Self {
            full_reindex: false,
            max_messages: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Counts and wall-clock duration of a run
#[derive(Debug, Clone, Default)]
pub struct IndexRunReport {
    pub messages_read: usize,
    pub chunks_indexed: usize,
    pub duration: Duration,
}

/// One verification check
#[derive(Debug, Clone)]
pub struct VerifyCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Cross-check of message store, state store, and index
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checks: Vec<VerifyCheck>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// The indexing orchestrator; owns every pipeline component
pub struct Indexer {
    reader: MessageReader,
    attachments: AttachmentReader,
    contacts: ContactResolver,
    graph: ChatGraph,
    state: StateStore,
    index: SearchIndex,
    embedder: Arc<dyn TextEmbedder>,
    vision: VisionEmbedder,
    chunker: ChunkerConfig,
    cancel: Arc<AtomicBool>,
}

impl Indexer {
    /// Open every component from configuration
    pub fn open(config: &AppConfig) -> Result<Self> {
        let index = SearchIndex::open(&config.index_db_path)?;
        index.health_check()?;
        index.initialize()?;

        Ok(Self {
            reader: MessageReader::open(&config.chat_db_path)?,
            attachments: AttachmentReader::open(&config.chat_db_path)?,
            contacts: ContactResolver::load(config.address_book_root.as_deref()),
            graph: ChatGraph::open(&config.graph_db_path)?,
            state: StateStore::open(&config.state_db_path)?,
            index,
            embedder: create_text_embedder(config),
            vision: VisionEmbedder::new(config.vision_model_path.clone()),
            chunker: ChunkerConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Assemble from explicit components (test harnesses)
    #[allow(clippy::too_many_arguments)]
    pub fn from_components(
        reader: MessageReader,
        attachments: AttachmentReader,
        contacts: ContactResolver,
        graph: ChatGraph,
        state: StateStore,
        index: SearchIndex,
        embedder: Arc<dyn TextEmbedder>,
        vision: VisionEmbedder,
    ) -> Self {
        Self {
            reader,
            attachments,
            contacts,
            graph,
            state,
            index,
            embedder,
            vision,
            chunker: ChunkerConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between batches; flipping it stops the run at the
    /// next batch boundary
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn graph(&self) -> &ChatGraph {
        &self.graph
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Run incremental (or full) indexing to completion
    pub async fn run(&mut self, opts: &IndexRunOptions) -> Result<IndexRunReport> {
        let started = Instant::now();

        self.index.health_check()?;

        if opts.full_reindex {
            info!("full reindex: clearing state and index");
            self.state.reset()?;
            self.index.clear()?;
            self.index.initialize()?;
        }

        let mut existing = self.state.indexed_chunk_hashes()?;
        let mut cursor = self.state.state()?.last_message_rowid;
        let mut report = IndexRunReport::default();

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("cancellation requested; stopping at batch boundary");
                break;
            }

            let batch_size = match opts.max_messages {
                Some(max) => opts.batch_size.min(max.saturating_sub(report.messages_read)),
                None => opts.batch_size,
            };
            if batch_size == 0 {
                break;
            }

            let messages = self.reader.read_messages(cursor, Some(batch_size))?;
            if messages.is_empty() {
                break;
            }
            let batch_len = messages.len();
            let batch_max_rowid = messages.last().map(|m| m.rowid).unwrap_or(cursor);

            let chunks = chunk_messages(&messages, &self.contacts, &self.chunker);
            let fresh = dedup_chunks(chunks, &mut existing);

            let indexed = if fresh.is_empty() {
                0
            } else {
                self.index_batch(&messages, fresh).await?
            };

            report.messages_read += batch_len;
            report.chunks_indexed += indexed;

            let state = self.state.state()?;
            self.state.update_state(&StateUpdate {
                last_message_rowid: Some(batch_max_rowid),
                last_indexed_at: Some(now_unix()),
                total_messages_indexed: Some(state.total_messages_indexed + batch_len as i64),
                total_chunks_created: Some(state.total_chunks_created + indexed as i64),
            })?;
            cursor = batch_max_rowid;

            info!(
                batch = batch_len,
                indexed,
                cursor,
                "completed indexing batch"
            );

            if batch_len < batch_size {
                break;
            }
        }

        report.duration = started.elapsed();
        info!(
            messages = report.messages_read,
            chunks = report.chunks_indexed,
            elapsed_ms = report.duration.as_millis() as u64,
            "indexing run finished"
        );
        Ok(report)
    }

    /// Enrich, embed, write, and record one deduplicated batch.
    /// Returns the number of chunks actually committed.
    async fn index_batch(&mut self, messages: &[RawMessage], chunks: Vec<Chunk>) -> Result<usize> {
        self.update_graph(messages)?;

        // Attachment flags per chunk, plus the first image for embedding
        let mut docs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mut has_attachment = false;
            let mut first_image = None;
            for rowid in &chunk.message_rowids {
                for attachment in self.attachments.attachments_for_message(*rowid)? {
                    has_attachment = true;
                    if attachment.is_image && first_image.is_none() {
                        first_image = Some(attachment.path.clone());
                    }
                }
            }

            let enriched = enrich_chunk(chunk, has_attachment, first_image.is_some());
            let image_embedding = match &first_image {
                Some(path) => self.vision.embed_image(path)?,
                None => None,
            };
            docs.push(IndexedDocument {
                chunk: enriched,
                text_embedding: None,
                image_embedding,
            });
        }

        // Batched text embedding, one retry with backoff on transient
        // failure, then the whole batch fails and the run stops at the
        // persisted cursor
        let texts: Vec<&str> = docs.iter().map(|d| d.chunk.text.as_str()).collect();
        let embeddings = match self.embedder.embed_batch(&texts) {
            Ok(embeddings) => embeddings,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "embedding batch failed; retrying after backoff");
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.embedder.embed_batch(&texts)?
            }
            Err(e) => return Err(e),
        };
        for (doc, embedding) in docs.iter_mut().zip(embeddings) {
            doc.text_embedding = Some(embedding);
        }

        let written = self.index.index_documents(&docs)?;
        self.index.refresh()?;

        // Only documents the store accepted become durable chunk
        // records; failures are retried on the next run
        let now = now_unix();
        let written_set: BTreeSet<&str> = written.iter().map(|s| s.as_str()).collect();
        let records: Vec<ChunkRecord> = docs
            .iter()
            .filter(|d| written_set.contains(d.chunk.id.as_str()))
            .map(|d| ChunkRecord {
                chunk_hash: d.chunk.id.clone(),
                message_rowids: d.chunk.message_rowids.clone(),
                document_id: d.chunk.id.clone(),
                created_at: now,
            })
            .collect();
        self.state.record_chunks(&records)?;

        Ok(records.len())
    }

    /// Keep the chat graph current with what the batch saw: chats,
    /// auto-created persons for unknown handles, and membership rows
    fn update_graph(&mut self, messages: &[RawMessage]) -> Result<()> {
        let owner = self.graph.ensure_owner("Me")?;

        let mut chats: BTreeMap<&str, (Option<&str>, bool, BTreeSet<&str>)> = BTreeMap::new();
        for message in messages {
            let entry = chats
                .entry(message.chat_id.as_str())
                .or_insert((None, false, BTreeSet::new()));
            if let Some(name) = &message.group_name {
                entry.0 = Some(name.as_str());
                entry.1 = true;
            }
            if let Some(handle) = &message.handle {
                entry.2.insert(handle.as_str());
            }
        }

        for (chat_id, (group_name, is_group, handles)) in chats {
            let is_group = is_group || handles.len() > 1;
            let chat = self
                .graph
                .resolve_or_create_chat(chat_id, group_name, is_group)?;

            let mut person_ids = vec![owner.id.clone()];
            for handle in handles {
                let display = self.contacts.resolve(handle);
                let person = self.graph.resolve_or_create_person(handle, &display)?;
                person_ids.push(person.id);
            }
            self.graph.ensure_participants(&chat.id, &person_ids)?;
        }
        Ok(())
    }

    /// Status block for the CLI
    pub fn status(&self) -> Result<IndexerStatus> {
        let state = self.state.state()?;
        let message_stats = self.reader.stats()?;
        let pending = self.reader.count_pending(state.last_message_rowid)?;

        Ok(IndexerStatus {
            last_message_rowid: state.last_message_rowid,
            last_indexed_at: state.last_indexed_at,
            total_messages_indexed: state.total_messages_indexed,
            total_chunks_created: state.total_chunks_created,
            index_stats: self.index.stats()?,
            message_stats,
            pending_messages: pending,
        })
    }

    /// Cross-check counts among message store, state, and index
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        let index_ok = self.index.health_check().is_ok();
        report.checks.push(VerifyCheck {
            name: "index reachable",
            passed: index_ok,
            detail: if index_ok {
                "health check ok".to_string()
            } else {
                "index store did not respond".to_string()
            },
        });
        if !index_ok {
            return Ok(report);
        }

        let state = self.state.state()?;
        let chunk_count = self.state.chunk_count()?;
        let doc_count = self.index.stats()?.document_count;
        report.checks.push(VerifyCheck {
            name: "chunk bookkeeping matches index",
            passed: chunk_count == doc_count,
            detail: format!("state records {} chunks, index holds {}", chunk_count, doc_count),
        });

        let message_stats = self.reader.stats()?;
        report.checks.push(VerifyCheck {
            name: "cursor within message store",
            passed: state.last_message_rowid <= message_stats.max_rowid,
            detail: format!(
                "cursor {} vs max rowid {}",
                state.last_message_rowid, message_stats.max_rowid
            ),
        });

        report.checks.push(VerifyCheck {
            name: "lifetime counters monotonic",
            passed: state.total_chunks_created >= chunk_count,
            detail: format!(
                "{} created over lifetime, {} currently recorded",
                state.total_chunks_created, chunk_count
            ),
        });

        Ok(report)
    }

    /// Release every owned handle
    pub fn close(self) {
        self.reader.close();
        self.attachments.close();
        self.graph.close();
        self.state.close();
        self.index.close();
    }
}
