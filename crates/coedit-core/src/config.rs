//! Coordinator configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. The pipeline catalog
//! (priorities, section affinities, query keywords) is data owned by the
//! document model and ships here as defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Priority given to pipelines that are not in the catalog.
pub const DEFAULT_PIPELINE_PRIORITY: u32 = 5;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lease and watchdog timing.
    pub locks: LockConfig,
    /// Intent queue housekeeping.
    pub intents: IntentConfig,
    /// Pipeline catalog and turn loop parameters.
    pub pipelines: PipelineConfig,
    /// Where locks are stored.
    pub storage: StorageConfig,
    /// Gateway bind settings.
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied when an acquire does not name one.
    pub default_ttl_ms: u64,
    /// Locks closer than this to expiry get a `lock:timeout_warning` each tick.
    pub warning_threshold_ms: u64,
    /// Watchdog tick. Also the practical expiry resolution.
    pub watchdog_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Completed/cancelled intents older than this are dropped by cleanup.
    pub cleanup_max_age_ms: u64,
    /// How often the coordinator runs that cleanup while started.
    pub cleanup_interval_ms: u64,
    /// Session that owns locks taken on behalf of queued intents.
    pub grant_session: String,
    /// TTL for locks granted to queued intents.
    pub grant_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Turns each pipeline runs for.
    pub max_turns: u32,
    /// Simulated work per turn.
    pub turn_delay_ms: u64,
    /// A `content` event is emitted every this many turns.
    pub content_every: u32,
    /// Pipeline selected when no keyword matches the query.
    pub fallback: String,
    /// Known pipelines.
    pub catalog: Vec<PipelineProfile>,
}

/// Static description of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProfile {
    pub name: String,
    pub priority: u32,
    /// Preferred section types, best first.
    #[serde(default)]
    pub affinity: Vec<String>,
    /// Query keywords that select this pipeline.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file. `None` means an in-memory database.
    pub path: Option<PathBuf>,
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

// ============================================================
// Defaults
// ============================================================

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            warning_threshold_ms: 5_000,
            watchdog_interval_ms: 1_000,
        }
    }
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            cleanup_max_age_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
            grant_session: "pipelines".into(),
            grant_ttl_ms: 30_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_turns: 6,
            turn_delay_ms: 500,
            content_every: 3,
            fallback: "reviewer".into(),
            catalog: default_catalog(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18800,
            bind: BindMode::default(),
        }
    }
}

fn profile(name: &str, priority: u32, affinity: &[&str], keywords: &[&str]) -> PipelineProfile {
    PipelineProfile {
        name: name.into(),
        priority,
        affinity: affinity.iter().map(|s| s.to_string()).collect(),
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_catalog() -> Vec<PipelineProfile> {
    vec![
        profile(
            "strategist",
            8,
            &["executive_summary", "goals", "strategy"],
            &["strategy", "goal", "vision", "roadmap", "summary"],
        ),
        profile(
            "researcher",
            7,
            &["market_research", "competitive_analysis", "user_research"],
            &["research", "market", "competitor", "persona"],
        ),
        profile(
            "tableau",
            6,
            &["success_metrics", "kpis", "analytics"],
            &["metric", "kpi", "dashboard", "chart", "analytics", "measure"],
        ),
        profile(
            "engineer",
            5,
            &["technical_requirements", "architecture", "dependencies"],
            &["technical", "architecture", "api", "implementation", "scalab"],
        ),
        profile(
            "designer",
            4,
            &["user_stories", "user_experience", "design"],
            &["design", "ux", "wireframe", "flow", "story"],
        ),
        profile(
            "reviewer",
            3,
            &["risks", "open_questions", "assumptions"],
            &["review", "risk", "feedback", "gap"],
        ),
    ]
}

// ============================================================
// Lookups
// ============================================================

impl PipelineConfig {
    pub fn profile(&self, name: &str) -> Option<&PipelineProfile> {
        self.catalog.iter().find(|p| p.name == name)
    }

    /// Catalog priority, or `DEFAULT_PIPELINE_PRIORITY` for unknown pipelines.
    pub fn priority_for(&self, name: &str) -> u32 {
        self.profile(name)
            .map(|p| p.priority)
            .unwrap_or(DEFAULT_PIPELINE_PRIORITY)
    }

    /// `max(0, 3 - i)` where `i` is the section type's index in the
    /// pipeline's affinity list; 0 when absent.
    pub fn affinity_for(&self, name: &str, section_type: Option<&str>) -> u32 {
        let (Some(profile), Some(section_type)) = (self.profile(name), section_type) else {
            return 0;
        };
        profile
            .affinity
            .iter()
            .position(|s| s == section_type)
            .map(|i| 3u32.saturating_sub(i as u32))
            .unwrap_or(0)
    }

    pub fn names(&self) -> Vec<String> {
        self.catalog.iter().map(|p| p.name.clone()).collect()
    }
}

// ============================================================
// Loading
// ============================================================

impl CoordinatorConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
