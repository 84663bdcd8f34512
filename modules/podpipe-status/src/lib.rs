//! The status aggregator: per-service progress records rolled up into
//! a single pipeline view, kept consistent under concurrent set/clear
//! races via atomic Lua scripts.

use std::collections::HashMap;

use podpipe_substrate::{SubstrateClient, SubstrateError};
use redis::Script;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const ACTIVE_EPISODES_KEY: &str = "pipeline:active_episodes";
pub const LEGACY_TRANSCRIPTION_STATUS_KEY: &str = "transcription:status";
/// Sentinel episode id reserved for worker-local bookkeeping; never
/// surfaced in a rollup's `active_episodes` list.
pub const CURRENT_SENTINEL: &str = "current";
const MAX_RECENT_LOGS: usize = 50;
const DEFAULT_STATUS_TTL_SECS: u64 = 3600;

/// The three services this aggregator knows about, matching the fixed
/// service list the clear-status script checks against.
pub const KNOWN_SERVICES: [&str; 3] = ["transcription", "summarization", "rag"];

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("failed to (de)serialize status record: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StatusResult<T> = std::result::Result<T, StatusError>;

fn status_key(service: &str, episode_id: &str) -> String {
    format!("status:{service}:{episode_id}")
}

fn stats_key(service: &str) -> String {
    format!("stats:{service}")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceStatusRecord {
    pub stage: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub recent_logs: Vec<String>,
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceStats {
    pub completed: u64,
    pub total: u64,
}

const SET_STATUS_LUA: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SETEX', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

const CLEAR_STATUS_LUA: &str = r#"
redis.call('DEL', KEYS[2])
local services = {'transcription', 'summarization', 'rag'}
local active = false
for _, svc in ipairs(services) do
    if redis.call('EXISTS', ARGV[2] .. svc .. ':' .. ARGV[1]) == 1 then
        active = true
        break
    end
end
if not active then
    redis.call('SREM', KEYS[1], ARGV[1])
end
return 1
"#;

#[derive(Clone)]
pub struct StatusAggregator {
    substrate: SubstrateClient,
    ttl_secs: u64,
}

impl StatusAggregator {
    pub fn new(substrate: SubstrateClient, ttl_secs: u64) -> Self {
        Self {
            substrate,
            ttl_secs,
        }
    }

    pub fn with_default_ttl(substrate: SubstrateClient) -> Self {
        Self::new(substrate, DEFAULT_STATUS_TTL_SECS)
    }

    /// Atomically add `episode_id` to the active set and write its status
    /// record with TTL.
    async fn set_service_status(
        &self,
        service: &str,
        episode_id: &str,
        record: &ServiceStatusRecord,
    ) -> StatusResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.substrate.connection();
        let script = Script::new(SET_STATUS_LUA);
        let _: i64 = script
            .key(ACTIVE_EPISODES_KEY)
            .key(status_key(service, episode_id))
            .arg(episode_id)
            .arg(payload)
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(SubstrateError::from)?;
        Ok(())
    }

    /// Merge `stage`/`progress`/`log_message`/`extra` into the episode's
    /// existing record for `service`, preserving the ring buffer of recent
    /// log lines, then commit atomically.
    pub async fn update_service_status(
        &self,
        service: &str,
        episode_id: &str,
        stage: &str,
        progress: f64,
        log_message: Option<&str>,
        extra: Option<HashMap<String, serde_json::Value>>,
    ) -> StatusResult<()> {
        let mut record = self.read_record(service, episode_id).await?.unwrap_or_default();

        if let Some(msg) = log_message {
            let timestamp = chrono::Utc::now().format("%H:%M:%S").to_string();
            record.recent_logs.insert(0, format!("[{timestamp}] {msg}"));
            record.recent_logs.truncate(MAX_RECENT_LOGS);
        }

        record.stage = stage.to_string();
        record.progress = progress;
        record.last_updated = Some(chrono::Utc::now().to_rfc3339());

        if let Some(extra) = extra {
            record.extra.extend(extra);
        }

        self.set_service_status(service, episode_id, &record).await
    }

    async fn read_record(
        &self,
        service: &str,
        episode_id: &str,
    ) -> StatusResult<Option<ServiceStatusRecord>> {
        match self.substrate.get(&status_key(service, episode_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Atomically delete this service's record for the episode and, if no
    /// other known service still has a live record, drop the episode from
    /// the active set ( "clear status" transaction — this is
    /// the race the scripting exists to close).
    pub async fn clear_service_status(&self, service: &str, episode_id: &str) -> StatusResult<()> {
        let mut conn = self.substrate.connection();
        let script = Script::new(CLEAR_STATUS_LUA);
        let _: i64 = script
            .key(ACTIVE_EPISODES_KEY)
            .key(status_key(service, episode_id))
            .arg(episode_id)
            .arg("status:")
            .invoke_async(&mut conn)
            .await
            .map_err(SubstrateError::from)?;
        Ok(())
    }

    pub async fn update_stats(&self, service: &str, completed: u64, total: u64) -> StatusResult<()> {
        let stats = ServiceStats { completed, total };
        let payload = serde_json::to_string(&stats)?;
        self.substrate.set_ex(&stats_key(service), &payload, self.ttl_secs * 24).await?;
        Ok(())
    }

    async fn read_stats(&self, service: &str) -> StatusResult<ServiceStats> {
        match self.substrate.get(&stats_key(service)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ServiceStats::default()),
        }
    }

    /// Build the rollup view: per-service stage blocks plus an
    /// `active_episodes` list merged by episode id, filtering out the
    /// worker-local sentinel. Self-heals by clearing stale `stats:*` keys
    /// when nothing is actually running.
    pub async fn get_pipeline_status(&self) -> StatusResult<PipelineStatus> {
        let active_ids: Vec<String> = self
            .substrate
            .smembers(ACTIVE_EPISODES_KEY)
            .await?
            .into_iter()
            .filter(|id| id != CURRENT_SENTINEL)
            .collect();

        let mut service_blocks = HashMap::new();
        let mut episodes: HashMap<String, EpisodeRollup> = HashMap::new();

        for service in KNOWN_SERVICES {
            let stats = self.read_stats(service).await?;
            let mut active_in_service = Vec::new();

            for episode_id in &active_ids {
                if let Some(record) = self.read_record(service, episode_id).await? {
                    active_in_service.push((episode_id.clone(), record));
                }
            }

            service_blocks.insert(
                service.to_string(),
                ServiceStageBlock {
                    active: !active_in_service.is_empty()
                        || (stats.completed < stats.total && stats.total > 0),
                    completed: stats.completed,
                    total: stats.total,
                    current: active_in_service.first().map(|(_, r)| r.clone()),
                },
            );

            for (episode_id, record) in active_in_service {
                let entry = episodes.entry(episode_id.clone()).or_insert_with(|| EpisodeRollup {
                    episode_id: episode_id.clone(),
                    stage: record.stage.clone(),
                    progress: record.progress,
                    services: HashMap::new(),
                });
                entry.services.insert(service.to_string(), record);
            }
        }

        let legacy_raw = self.substrate.get(LEGACY_TRANSCRIPTION_STATUS_KEY).await?;
        let legacy: LegacyTranscriptionStatus = match legacy_raw {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => LegacyTranscriptionStatus::default(),
        };

        let is_running =
            legacy.is_running || !episodes.is_empty() || !active_ids.is_empty();

        if !is_running && !active_ids.is_empty() {
            self.substrate.del(ACTIVE_EPISODES_KEY).await?;
            for service in KNOWN_SERVICES {
                self.substrate.del(&stats_key(service)).await?;
            }
            info!("self-healed stale pipeline status: cleared active set and stats");
        }

        Ok(PipelineStatus {
            is_running,
            stages: service_blocks,
            active_episodes: episodes.into_values().collect(),
            gpu_name: legacy.gpu_name,
            gpu_usage: legacy.gpu_usage,
            vram_used_gb: legacy.vram_used_gb,
            vram_total_gb: legacy.vram_total_gb,
        })
    }

    /// Force-clear all pipeline status and stats. Administrative.
    pub async fn clear_all(&self) -> StatusResult<()> {
        self.substrate.del(ACTIVE_EPISODES_KEY).await?;
        for service in KNOWN_SERVICES {
            self.substrate.del(&stats_key(service)).await?;
        }
        self.substrate.del(LEGACY_TRANSCRIPTION_STATUS_KEY).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStageBlock {
    pub active: bool,
    pub completed: u64,
    pub total: u64,
    pub current: Option<ServiceStatusRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRollup {
    pub episode_id: String,
    pub stage: String,
    pub progress: f64,
    pub services: HashMap<String, ServiceStatusRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LegacyTranscriptionStatus {
    #[serde(default)]
    is_running: bool,
    gpu_name: Option<String>,
    #[serde(default)]
    gpu_usage: f64,
    #[serde(default)]
    vram_used_gb: f64,
    #[serde(default)]
    vram_total_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub is_running: bool,
    pub stages: HashMap<String, ServiceStageBlock>,
    pub active_episodes: Vec<EpisodeRollup>,
    pub gpu_name: Option<String>,
    pub gpu_usage: f64,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> Option<String> {
        std::env::var("REDIS_TEST_URL").ok()
    }

    #[tokio::test]
    async fn clear_leaves_episode_active_while_sibling_service_still_reports() {
        let Some(url) = test_url() else { return };
        let substrate = SubstrateClient::connect(&url).await.unwrap();
        let agg = StatusAggregator::with_default_ttl(substrate.clone());
        let episode_id = "ep-status-race";

        agg.clear_service_status("transcription", episode_id).await.unwrap();
        agg.clear_service_status("rag", episode_id).await.unwrap();
        substrate.del(ACTIVE_EPISODES_KEY).await.unwrap();

        agg.update_service_status("transcription", episode_id, "transcribing", 0.5, None, None)
            .await
            .unwrap();
        agg.update_service_status("rag", episode_id, "chunking", 0.1, None, None)
            .await
            .unwrap();

        agg.clear_service_status("transcription", episode_id).await.unwrap();

        let members = substrate.smembers(ACTIVE_EPISODES_KEY).await.unwrap();
        assert!(members.contains(&episode_id.to_string()));

        agg.clear_service_status("rag", episode_id).await.unwrap();
        let members = substrate.smembers(ACTIVE_EPISODES_KEY).await.unwrap();
        assert!(!members.contains(&episode_id.to_string()));
    }

    #[tokio::test]
    async fn recent_logs_ring_buffer_caps_at_fifty() {
        let Some(url) = test_url() else { return };
        let substrate = SubstrateClient::connect(&url).await.unwrap();
        let agg = StatusAggregator::with_default_ttl(substrate.clone());
        let episode_id = "ep-log-ring";
        agg.clear_service_status("transcription", episode_id).await.unwrap();

        for i in 0..60 {
            agg.update_service_status(
                "transcription",
                episode_id,
                "transcribing",
                0.0,
                Some(&format!("line {i}")),
                None,
            )
            .await
            .unwrap();
        }

        let record = agg.read_record("transcription", episode_id).await.unwrap().unwrap();
        assert_eq!(record.recent_logs.len(), 50);
        assert!(record.recent_logs[0].contains("line 59"));

        agg.clear_service_status("transcription", episode_id).await.unwrap();
    }
}
