//! Persisted BM25 keyword index: append-then-atomic-rewrite under a file
//! lock, so a reader never observes a half-written index file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use bm25::{Language, SearchEngine, SearchEngineBuilder};
use fs2::FileExt;
use thiserror::Error;

pub type ChunkSearchEngine = SearchEngine<String>;

#[derive(Debug, Error)]
pub enum KeywordIndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize keyword index: {0}")]
    Serde(#[from] serde_json::Error),
}

type KeywordResult<T> = std::result::Result<T, KeywordIndexError>;

/// One document to add to the index: its chunk id and the text to score.
pub struct IndexDocument {
    pub id: String,
    pub text: String,
}

#[derive(Clone)]
pub struct KeywordIndex {
    path: PathBuf,
}

impl KeywordIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> KeywordResult<ChunkSearchEngine> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(SearchEngineBuilder::<String>::with_corpus(Language::English, Vec::<String>::new()).build())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add `documents` to the persisted index, rewriting the backing file
    /// under an exclusive file lock via write-temp-then-rename so
    /// concurrent ingestion jobs never corrupt each other's writes.
    pub fn append_documents(&self, documents: &[IndexDocument]) -> KeywordResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&self.path);
        let lock_file = OpenOptions::new().create(true).write(true).truncate(false).open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = (|| -> KeywordResult<()> {
            let mut engine = self.load()?;
            for doc in documents {
                engine.upsert(doc.id.clone(), doc.text.as_str());
            }

            let tmp_path = self.path.with_extension("tmp");
            let bytes = serde_json::to_vec(&engine)?;
            std::fs::write(&tmp_path, bytes)?;
            std::fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();

        lock_file.unlock().ok();
        result
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    lock_name.push(".lock");
    path.with_file_name(lock_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_reload_round_trips_the_index() {
        let dir = std::env::temp_dir().join(format!("podpipe-keyword-test-{}", uuid::Uuid::new_v4()));
        let index_path = dir.join("keyword_index.json");
        let index = KeywordIndex::new(&index_path);

        index
            .append_documents(&[
                IndexDocument { id: "c1".into(), text: "the quick brown fox".into() },
                IndexDocument { id: "c2".into(), text: "jumps over the lazy dog".into() },
            ])
            .unwrap();

        assert!(index_path.exists());
        let reloaded = index.load().unwrap();
        let results = reloaded.search("quick fox", 5);
        assert!(!results.is_empty());
        assert_eq!(results[0].id, "c1");

        std::fs::remove_dir_all(&dir).ok();
    }
}
