//! Interface de linha de comando do metrika-score baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] para pontuação,
//! uploads de conversões e webhooks, e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::orchestrator::DEFAULT_PAGE_LIMIT;

/// Pontua visitas do Metrika e reconcilia uploads de conversões offline.
#[derive(Debug, Parser)]
#[command(name = "metrika-score", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Credenciais do contador; sem flags, vêm da configuração.
#[derive(Debug, Clone, Args)]
pub struct CounterArgs {
    /// Token OAuth do Metrika.
    #[arg(long)]
    pub token: Option<String>,

    /// ID do contador.
    #[arg(long)]
    pub counter: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria uma tarefa de pontuação para um dia e acompanha até o fim.
    Score {
        /// Data no formato YYYY-MM-DD.
        date: String,

        #[command(flatten)]
        auth: CounterArgs,

        /// Grava os resultados em um arquivo JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Mostra o status de uma tarefa.
    JobStatus { task_id: String },

    /// Lista uma página dos resultados de uma tarefa concluída.
    JobResult {
        task_id: String,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Envia as visitas tier-4+ de uma tarefa como conversões.
    UploadBulk {
        task_id: String,

        /// Identificador da meta no Metrika.
        #[arg(long)]
        target: String,

        #[command(flatten)]
        auth: CounterArgs,
    },

    /// Envia uma única conversão.
    UploadSingle {
        #[arg(long)]
        target: String,

        /// Data e hora da conversão (RFC 3339 ou `YYYY-MM-DD HH:MM:SS`).
        #[arg(long)]
        date_time: String,

        #[arg(long)]
        client_id: Option<String>,

        #[arg(long)]
        user_id: Option<String>,

        #[arg(long)]
        yclid: Option<String>,

        #[arg(long)]
        purchase_id: Option<String>,

        #[arg(long)]
        price: Option<f64>,

        #[arg(long)]
        currency: Option<String>,

        #[command(flatten)]
        auth: CounterArgs,
    },

    /// Mostra o status de um upload, consultando o Metrika se necessário.
    UploadStatus { upload_id: String },

    /// Lista os uploads de uma tarefa.
    TaskUploads { task_id: String },

    /// Registra um webhook e imprime seu segredo.
    WebhookRegister {
        name: String,

        #[command(flatten)]
        auth: CounterArgs,
    },

    /// Envia um lote de conversões (arquivo JSON) por um webhook e aguarda o upload.
    WebhookSubmit {
        webhook_id: String,

        #[arg(long)]
        secret: String,

        /// Arquivo JSON com uma lista de conversões.
        file: PathBuf,

        /// Aguarda a reconciliação do lote antes de sair.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Mostra o status de um lote de webhook.
    WebhookStatus {
        webhook_id: String,

        batch_id: String,

        #[arg(long)]
        secret: String,
    },
}
