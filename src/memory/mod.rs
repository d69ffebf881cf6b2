//! 记忆层：有限窗口（QueueController）、核心记忆、归档 / 索引存储、摘要、快照持久化

pub mod archive;
pub mod core_memory;
pub mod entry;
pub mod index;
pub mod ingest;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod summarizer;
pub mod token_counter;
pub mod tokenizer;

pub use archive::{open_sqlite_pool, ArchiveStore, InMemoryArchive, SqliteArchive};
pub use core_memory::{default_sections, CoreMemoryBlock, CoreMemoryError, SectionSpec};
pub use entry::{Entry, EntryKind};
pub use index::{InMemoryIndex, IndexStore, ScoredDocument, SqliteIndex};
pub use ingest::{ingest_messages, load_messages, IngestMessage, IngestReport};
pub use message::{Message, Role};
pub use persistence::{SessionSnapshot, SnapshotPersistence};
pub use queue::{
    EvictionPipeline, EvictionReport, PressureReport, PressureState, PushOutcome, QueueConfig,
    QueueController, WindowStatus, PRESSURE_ADVISORY,
};
pub use summarizer::{ConcatSummarizer, LlmSummarizer, SummarizeError, Summarizer};
pub use token_counter::TokenCounter;
