use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use turn_relay::{RelayConfig, TurnConfig};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [backend]
//                    model = "gpt-4o-mini"
//
//   env var:         CONCIERGE_BACKEND__MODEL=gpt-4o-mini   (double underscore = nesting)
//
//   (single underscore stays within field names: CONCIERGE_BACKEND__HISTORY_TURNS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub catalog: CatalogFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Generation backend (lives under `[backend]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    /// Chat-completions endpoint
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Sent as a bearer token when set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            model: default_model(),
            api_key: None,
            system_prompt: default_system_prompt(),
            history_turns: default_history_turns(),
            max_candidates: default_max_candidates(),
        }
    }
}

/// Stream bounds (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_max_reassembly_bytes")]
    pub max_reassembly_bytes: usize,
    #[serde(default = "default_max_marker_bytes")]
    pub max_marker_bytes: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            max_reassembly_bytes: default_max_reassembly_bytes(),
            max_marker_bytes: default_max_marker_bytes(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Controlled vocabulary seeded at startup (lives under `[catalog]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogFileConfig {
    #[serde(default = "default_specializations")]
    pub specializations: Vec<String>,
}

impl Default for CatalogFileConfig {
    fn default() -> Self {
        Self {
            specializations: default_specializations(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_backend_url() -> String {
    "http://127.0.0.1:11434/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_system_prompt() -> String {
    "Eres el asistente de bienvenida de una red de grupos profesionales. \
     Responde siempre en español, con frases breves y cercanas."
        .to_string()
}
fn default_history_turns() -> usize {
    20
}
fn default_max_candidates() -> usize {
    5
}
fn default_max_line_bytes() -> usize {
    turn_relay::framer::DEFAULT_MAX_LINE_BYTES
}
fn default_max_reassembly_bytes() -> usize {
    turn_relay::reassembler::DEFAULT_MAX_REASSEMBLY_BYTES
}
fn default_max_marker_bytes() -> usize {
    turn_relay::scanner::DEFAULT_MAX_MARKER_BYTES
}
fn default_event_buffer() -> usize {
    64
}
fn default_specializations() -> Vec<String> {
    [
        "Abogado",
        "Arquitecto",
        "Asesor fiscal",
        "Dentista",
        "Fisioterapeuta",
        "Fotógrafo",
        "Inmobiliaria",
        "Seguros",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Build a figment that layers: defaults → config.toml → CONCIERGE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CONCIERGE_SERVER__PORT=9090`  →  `server.port = 9090`
///   `CONCIERGE_BACKEND__API_KEY=sk-…`  →  `backend.api_key = "sk-…"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CONCIERGE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

/// Upstream connection settings (runtime view).
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl BackendConfig {
    pub fn from_file(fc: &BackendFileConfig) -> Self {
        Self {
            url: fc.url.clone(),
            model: fc.model.clone(),
            api_key: fc.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

pub fn relay_config(fc: &RelayFileConfig) -> RelayConfig {
    RelayConfig {
        max_line_bytes: fc.max_line_bytes,
        max_reassembly_bytes: fc.max_reassembly_bytes,
        max_marker_bytes: fc.max_marker_bytes,
        // A zero-capacity channel would panic
        event_buffer: fc.event_buffer.max(1),
    }
}

pub fn turn_config(fc: &FileConfig) -> TurnConfig {
    TurnConfig {
        system_prompt: fc.backend.system_prompt.clone(),
        history_turns: fc.backend.history_turns,
        max_candidates: fc.backend.max_candidates,
        relay: relay_config(&fc.relay),
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConciergeConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl ConciergeConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".concierge"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("concierge.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
