//! Configuração do metrika-score carregada a partir de `metrika-score.toml`.
//!
//! A struct [`ScoreConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis `METRIKA_TOKEN`, `METRIKA_COUNTER` e `METRIKA_API_URL`
//! têm precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::metrika::client::API_URL;
use crate::state_machine::RetryConfig;
use crate::store::StoreConfig;

pub const DEFAULT_CONFIG_PATH: &str = "metrika-score.toml";

/// Configuração de nível superior carregada de `metrika-score.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreConfig {
    /// URL base da API de gestão do Metrika.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Token OAuth usado quando a CLI não recebe `--token`.
    #[serde(default)]
    pub token: String,

    /// Contador usado quando a CLI não recebe `--counter`.
    #[serde(default)]
    pub counter: Option<u64>,

    /// Intervalo entre consultas ao status de uma exportação de logs.
    #[serde(default = "default_export_poll_interval_ms")]
    pub export_poll_interval_ms: u64,

    /// Diretório com os artefatos `level4_*.json`.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Limiar de probabilidade por classe de dispositivo; sobrepõe
    /// `level4_thresholds.json`.
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,

    /// URL pública usada para montar os endereços dos webhooks.
    #[serde(default = "default_webhook_base_url")]
    pub webhook_base_url: String,

    /// Filtro do `tracing` quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Política de reconciliação dos uploads.
    #[serde(default)]
    pub upload: RetryConfig,

    /// Backend de persistência. Por padrão `file` em `data/`, para que os
    /// registros sobrevivam entre invocações da CLI.
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_api_base_url() -> String {
    API_URL.to_string()
}

// Valor padrão para o intervalo de consulta das exportações: 8000ms.
fn default_export_poll_interval_ms() -> u64 {
    8000
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_webhook_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            token: String::new(),
            counter: None,
            export_poll_interval_ms: default_export_poll_interval_ms(),
            model_dir: default_model_dir(),
            thresholds: HashMap::new(),
            webhook_base_url: default_webhook_base_url(),
            log_filter: default_log_filter(),
            upload: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ScoreConfig {
    /// Carrega a configuração de `path` (ou `metrika-score.toml` no diretório
    /// atual). Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<ScoreConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Aplica as variáveis de ambiente não vazias sobre a configuração.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = var("METRIKA_TOKEN") {
            self.token = token;
        }
        if let Some(counter) = var("METRIKA_COUNTER") {
            let counter = counter
                .parse()
                .with_context(|| format!("METRIKA_COUNTER is not a number: '{counter}'"))?;
            self.counter = Some(counter);
        }
        if let Some(url) = var("METRIKA_API_URL") {
            self.api_base_url = url;
        }
        Ok(self)
    }

    pub fn export_poll_interval(&self) -> Duration {
        Duration::from_millis(self.export_poll_interval_ms)
    }
}
