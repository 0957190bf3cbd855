use crate::email::EmailRecord;
use crate::engine::{RiskLevel, RiskVerdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored analysis could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("email id {0:?} cannot be used as a storage key")]
    InvalidId(String),
}

/// A verdict together with the email fields needed to list it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub analyzed_at: DateTime<Utc>,
    pub verdict: RiskVerdict,
}

impl StoredAnalysis {
    pub fn new(email: &EmailRecord, verdict: RiskVerdict) -> Self {
        Self {
            email_id: email.id.clone(),
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            date: email.date.clone(),
            analyzed_at: Utc::now(),
            verdict,
        }
    }
}

/// Persistence for finished analyses. Saving under an existing id replaces it.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    async fn save(&self, analysis: StoredAnalysis) -> Result<(), StoreError>;
    async fn get(&self, email_id: &str) -> Result<Option<StoredAnalysis>, StoreError>;
    /// Most recent first.
    async fn list(&self, limit: usize) -> Result<Vec<StoredAnalysis>, StoreError>;
    /// Most recent first, only verdicts at `min_level` or above.
    async fn list_at_least(
        &self,
        min_level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<StoredAnalysis>, StoreError>;
}

fn at_least(analyses: Vec<StoredAnalysis>, min_level: RiskLevel) -> Vec<StoredAnalysis> {
    analyses
        .into_iter()
        .filter(|a| a.verdict.risk_level >= min_level)
        .collect()
}

fn most_recent_first(mut analyses: Vec<StoredAnalysis>, limit: usize) -> Vec<StoredAnalysis> {
    analyses.sort_by(|a, b| {
        b.analyzed_at
            .cmp(&a.analyzed_at)
            .then_with(|| a.email_id.cmp(&b.email_id))
    });
    analyses.truncate(limit);
    analyses
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    analyses: RwLock<HashMap<String, StoredAnalysis>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictStore for MemoryStore {
    async fn save(&self, analysis: StoredAnalysis) -> Result<(), StoreError> {
        let mut analyses = self.analyses.write().await;
        analyses.insert(analysis.email_id.clone(), analysis);
        Ok(())
    }

    async fn get(&self, email_id: &str) -> Result<Option<StoredAnalysis>, StoreError> {
        Ok(self.analyses.read().await.get(email_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<StoredAnalysis>, StoreError> {
        let analyses = self.analyses.read().await.values().cloned().collect();
        Ok(most_recent_first(analyses, limit))
    }

    async fn list_at_least(
        &self,
        min_level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<StoredAnalysis>, StoreError> {
        let analyses = self.analyses.read().await.values().cloned().collect();
        Ok(most_recent_first(at_least(analyses, min_level), limit))
    }
}

/// One pretty-printed `<email id>.json` document per analysis.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    fn path_for(&self, email_id: &str) -> Result<PathBuf, StoreError> {
        if email_id.is_empty()
            || email_id.contains(['/', '\\', '\0'])
            || email_id.contains("..")
        {
            return Err(StoreError::InvalidId(email_id.to_string()));
        }
        Ok(self.directory.join(format!("{email_id}.json")))
    }

    async fn read_all(&self) -> Result<Vec<StoredAnalysis>, StoreError> {
        let mut analyses = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<StoredAnalysis>(&content) {
                Ok(analysis) => analyses.push(analysis),
                Err(e) => log::warn!("Skipping unreadable analysis {}: {e}", path.display()),
            }
        }

        Ok(analyses)
    }
}

#[async_trait]
impl VerdictStore for JsonFileStore {
    async fn save(&self, analysis: StoredAnalysis) -> Result<(), StoreError> {
        let path = self.path_for(&analysis.email_id)?;
        let content = serde_json::to_string_pretty(&analysis)?;
        tokio::fs::write(&path, content).await?;
        log::debug!("Stored analysis {} at {}", analysis.email_id, path.display());
        Ok(())
    }

    async fn get(&self, email_id: &str) -> Result<Option<StoredAnalysis>, StoreError> {
        let path = self.path_for(email_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<StoredAnalysis>, StoreError> {
        Ok(most_recent_first(self.read_all().await?, limit))
    }

    async fn list_at_least(
        &self,
        min_level: RiskLevel,
        limit: usize,
    ) -> Result<Vec<StoredAnalysis>, StoreError> {
        let analyses = at_least(self.read_all().await?, min_level);
        Ok(most_recent_first(analyses, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskThresholds;
    use crate::features::{DetectorKind, DetectorResult};
    use chrono::Duration;

    fn analysis(id: &str, minutes_ago: i64) -> StoredAnalysis {
        let email = EmailRecord {
            id: id.to_string(),
            sender: "a@example.com".to_string(),
            subject: format!("Subject {id}"),
            date: String::new(),
            body: String::new(),
            attachments: Vec::new(),
            client_ip: None,
        };
        let mut stored = StoredAnalysis::new(&email, RiskVerdict::failed("test"));
        stored.analyzed_at = Utc::now() - Duration::minutes(minutes_ago);
        stored
    }

    fn scored(id: &str, minutes_ago: i64, score: u32) -> StoredAnalysis {
        let mut result = DetectorResult::new(DetectorKind::Content);
        result.penalize(score, "scored");
        let mut stored = analysis(id, minutes_ago);
        stored.verdict = RiskVerdict::from_results(vec![result], &RiskThresholds::default());
        stored
    }

    async fn seed(store: &dyn VerdictStore) {
        store.save(scored("safe", 1, 0)).await.unwrap();
        store.save(scored("medium", 2, 45)).await.unwrap();
        store.save(scored("critical", 3, 90)).await.unwrap();
        store.save(scored("high", 4, 65)).await.unwrap();
        store.save(analysis("failed", 5)).await.unwrap();
    }

    fn ids(analyses: &[StoredAnalysis]) -> Vec<&str> {
        analyses.iter().map(|a| a.email_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(analysis("old", 30)).await.unwrap();
        store.save(analysis("new", 1)).await.unwrap();
        store.save(analysis("mid", 10)).await.unwrap();

        let listed = store.list(2).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|a| a.email_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);

        assert_eq!(store.get("old").await.unwrap().unwrap().subject, "Subject old");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let store = MemoryStore::new();
        store.save(analysis("same", 10)).await.unwrap();
        let mut updated = analysis("same", 0);
        updated.subject = "Updated".to_string();
        store.save(updated).await.unwrap();

        assert_eq!(store.list(10).await.unwrap().len(), 1);
        assert_eq!(store.get("same").await.unwrap().unwrap().subject, "Updated");
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("verdicts")).await.unwrap();

        let first = analysis("abc123@mail.example.com", 5);
        store.save(first.clone()).await.unwrap();
        store.save(analysis("def456", 1)).await.unwrap();

        let loaded = store.get("abc123@mail.example.com").await.unwrap().unwrap();
        assert_eq!(loaded, first);

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].email_id, "def456");

        assert!(store.get("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_store_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.save(analysis("kept", 1)).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].email_id, "kept");
    }

    #[tokio::test]
    async fn test_path_like_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();

        for id in ["../escape", "a/b", "a\\b", ""] {
            assert!(matches!(
                store.save(analysis(id, 0)).await,
                Err(StoreError::InvalidId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store_filters_by_level() {
        let store = MemoryStore::new();
        seed(&store).await;

        let risky = store.list_at_least(RiskLevel::High, 10).await.unwrap();
        assert_eq!(ids(&risky), vec!["critical", "high", "failed"]);

        let top = store.list_at_least(RiskLevel::Medium, 2).await.unwrap();
        assert_eq!(ids(&top), vec!["medium", "critical"]);

        let all = store.list_at_least(RiskLevel::Safe, 10).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_json_file_store_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        seed(&store).await;

        let risky = store.list_at_least(RiskLevel::Critical, 10).await.unwrap();
        assert_eq!(ids(&risky), vec!["critical", "failed"]);
        assert!(store
            .list_at_least(RiskLevel::Error, 10)
            .await
            .unwrap()
            .iter()
            .all(|a| a.verdict.risk_score == 100));
    }
}
