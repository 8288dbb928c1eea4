use crate::types::{AgentRole, AgentSpec, Directive, LifecycleState, MetricReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Persisted view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id.
    pub id: Uuid,
    /// Agent role.
    pub role: AgentRole,
    /// Agent display name.
    pub display_name: String,
    /// Spec the agent was created from.
    pub spec: AgentSpec,
    /// Last recorded lifecycle state.
    pub state: LifecycleState,
    /// When the agent was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Persistence boundary. Reports and directives are append-only; range
/// scans are half-open, `[from, to)`.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn append_reports(&self, reports: &[MetricReport]) -> FleetResult<()>;
    async fn append_directive(&self, directive: &Directive) -> FleetResult<()>;
    async fn put_agent(&self, record: &AgentRecord) -> FleetResult<()>;
    async fn get_agent(&self, id: Uuid) -> FleetResult<Option<AgentRecord>>;
    async fn list_agents(&self) -> FleetResult<Vec<AgentRecord>>;
    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricReport>>;
    async fn directives_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<Directive>>;
}

/// In-process store, lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    reports: RwLock<Vec<MetricReport>>,
    directives: RwLock<Vec<Directive>>,
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn append_reports(&self, reports: &[MetricReport]) -> FleetResult<()> {
        self.reports.write().await.extend_from_slice(reports);
        Ok(())
    }

    async fn append_directive(&self, directive: &Directive) -> FleetResult<()> {
        self.directives.write().await.push(directive.clone());
        Ok(())
    }

    async fn put_agent(&self, record: &AgentRecord) -> FleetResult<()> {
        self.agents.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> FleetResult<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn list_agents(&self) -> FleetResult<Vec<AgentRecord>> {
        let mut records: Vec<AgentRecord> = self.agents.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricReport>> {
        Ok(self
            .reports
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect())
    }

    async fn directives_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<Directive>> {
        Ok(self
            .directives
            .read()
            .await
            .iter()
            .filter(|d| d.issued_at >= from && d.issued_at < to)
            .cloned()
            .collect())
    }
}

/// File-backed store: `reports.jsonl` and `directives.jsonl` appended one
/// JSON document per line, agents as `agents/<id>.json`.
pub struct FileStore {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl FileStore {
    /// Store rooted at `dir`, created if missing.
    pub async fn new(dir: PathBuf) -> FleetResult<Self> {
        tokio::fs::create_dir_all(dir.join("agents")).await?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    fn reports_path(&self) -> PathBuf {
        self.dir.join("reports.jsonl")
    }

    fn directives_path(&self) -> PathBuf {
        self.dir.join("directives.jsonl")
    }

    fn agent_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("agents").join(format!("{id}.json"))
    }

    async fn append_lines<T: Serialize>(&self, path: PathBuf, items: &[T]) -> FleetResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for item in items {
            buf.push_str(&serde_json::to_string(item)?);
            buf.push('\n');
        }
        let _guard = self.append_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, path: PathBuf) -> FleetResult<Vec<T>> {
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    FleetError::Store(format!("corrupt line in {}: {e}", path.display()))
                })
            })
            .collect()
    }
}

#[async_trait]
impl FleetStore for FileStore {
    async fn append_reports(&self, reports: &[MetricReport]) -> FleetResult<()> {
        self.append_lines(self.reports_path(), reports).await
    }

    async fn append_directive(&self, directive: &Directive) -> FleetResult<()> {
        self.append_lines(self.directives_path(), std::slice::from_ref(directive))
            .await
    }

    async fn put_agent(&self, record: &AgentRecord) -> FleetResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.agent_path(record.id), json).await?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> FleetResult<Option<AgentRecord>> {
        let path = self.agent_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let record = serde_json::from_str(&data)
            .map_err(|e| FleetError::Store(format!("Failed to parse agent record: {e}")))?;
        Ok(Some(record))
    }

    async fn list_agents(&self) -> FleetResult<Vec<AgentRecord>> {
        let mut entries = tokio::fs::read_dir(self.dir.join("agents")).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(id) = name
                .strip_suffix(".json")
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            if let Some(record) = self.get_agent(id).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r: &AgentRecord| r.created_at);
        Ok(records)
    }

    async fn reports_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<MetricReport>> {
        let reports: Vec<MetricReport> = self.read_lines(self.reports_path()).await?;
        Ok(reports
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .collect())
    }

    async fn directives_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FleetResult<Vec<Directive>> {
        let directives: Vec<Directive> = self.read_lines(self.directives_path()).await?;
        Ok(directives
            .into_iter()
            .filter(|d| d.issued_at >= from && d.issued_at < to)
            .collect())
    }
}

/// File store under `data_dir` when one is configured, memory otherwise.
pub async fn open_store(data_dir: Option<&Path>) -> FleetResult<Arc<dyn FleetStore>> {
    match data_dir {
        Some(dir) => Ok(Arc::new(FileStore::new(dir.to_path_buf()).await?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
