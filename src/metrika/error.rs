//! Tipos de erro para o cliente da API da Yandex.Metrika.
//!
//! Define [`MetrikaError`] com variantes para erros da API, erros de rede
//! e respostas que não puderam ser interpretadas. Usa `thiserror` para
//! derivar `Display` e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Metrika.
///
/// - [`ApiError`](MetrikaError::ApiError) — qualquer resposta HTTP fora de 2xx
/// - [`NetworkError`](MetrikaError::NetworkError) — falha na camada de rede
/// - [`ParseError`](MetrikaError::ParseError) — corpo inesperado (JSON ou TSV)
/// - [`ExportFailed`](MetrikaError::ExportFailed) — exportação terminou num estado sem volta
#[derive(Debug, Error)]
pub enum MetrikaError {
    /// Erro retornado pela API (ex.: 403 token sem permissão, 400 data inválida).
    /// A mensagem é o corpo da resposta, sem alterações.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// O corpo da resposta não tem o formato esperado.
    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// A exportação de logs parou num estado que não leva a `processed`
    /// (ex.: `canceled`, `cleaned_by_user`).
    #[error("log request {request_id} ended with status '{status}'")]
    ExportFailed { request_id: u64, status: String },
}
