//! Tipos de dados trocados com a API de gerenciamento da Metrika.
//!
//! Cobre as requisições de exportação de logs (`logrequests`), as tabelas
//! TSV baixadas dessas exportações e as respostas da API de conversões
//! offline (`offline_conversions`).

use serde::{Deserialize, Serialize};

/// Credenciais de um contador: número do contador e token OAuth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAuth {
    pub counter: u64,
    pub token: String,
}

impl CounterAuth {
    pub fn new(counter: u64, token: impl Into<String>) -> Self {
        Self {
            counter,
            token: token.into(),
        }
    }
}

/// Fonte de uma exportação de logs: visitas ou visualizações de página.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Visits,
    Hits,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Visits => "visits",
            LogSource::Hits => "hits",
        }
    }

    /// Campos pedidos à API para cada fonte.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            LogSource::Visits => &[
                "ym:s:visitID",
                "ym:s:clientID",
                "ym:s:watchIDs",
                "ym:s:dateTime",
                "ym:s:visitDuration",
                "ym:s:bounce",
                "ym:s:pageViews",
                "ym:s:deviceCategory",
            ],
            LogSource::Hits => &["ym:pv:watchID", "ym:pv:dateTime", "ym:pv:deviceCategory"],
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope `{"log_request": {...}}` retornado pelos endpoints de logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequestEnvelope {
    pub log_request: LogRequestInfo,
}

/// Estado de uma exportação de logs no lado da Metrika.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequestInfo {
    pub request_id: u64,
    pub status: String,
    /// Partes disponíveis para download; presente só após o processamento.
    #[serde(default)]
    pub parts: Vec<LogRequestPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequestPart {
    pub part_number: u32,
    #[serde(default)]
    pub size: u64,
}

/// Tabela TSV baixada de uma exportação: cabeçalho mais linhas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl LogTable {
    /// Índice de uma coluna pelo nome.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Anexa as linhas de outra parte da mesma exportação.
    /// Cabeçalhos divergentes são um erro de integridade do chamador.
    pub fn append(&mut self, other: LogTable) -> bool {
        if self.columns.is_empty() {
            *self = other;
            return true;
        }
        if self.columns != other.columns {
            return false;
        }
        self.rows.extend(other.rows);
        true
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Envelope `{"uploading": {...}}` da API de conversões offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadingEnvelope {
    pub uploading: UploadingInfo,
}

/// Estado de um upload de conversões offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadingInfo {
    /// A Metrika devolve o id como número; aceitamos também string.
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// Linhas aceitas pela Metrika até agora.
    #[serde(default)]
    pub line_quantity: Option<u64>,
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Num(u64),
        Text(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Num(n) => n.to_string(),
        RawId::Text(s) => s,
    })
}
