//! Interface de terminal do metrika-score: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de uma tarefa de pontuação no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::state_machine::{Job, JobStatus, UploadReport, UploadStatus};

/// Indicador visual de progresso para uma tarefa no terminal.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição da tarefa.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{prefix:>3}%] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_prefix("0");
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Atualiza o spinner com o progresso e a mensagem atuais da tarefa.
    pub fn update(&self, job: &Job) {
        self.pb.set_prefix(job.progress.to_string());
        self.pb.set_message(job.message.clone());
    }

    /// Finaliza o spinner e exibe o resultado final da tarefa.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.status {
            JobStatus::Done => {
                println!("  {} {}", self.green.apply_to("✓"), job.message);
            }
            _ => {
                let reason = job.error.as_deref().unwrap_or(job.message.as_str());
                println!("  {} Task failed: {reason}", self.red.apply_to("✗"));
            }
        }
        println!("  task id: {}", job.id);
    }
}

fn job_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Done => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Pending | JobStatus::Running => Style::new().yellow(),
    }
}

fn upload_style(status: UploadStatus) -> Style {
    match status {
        UploadStatus::Completed => Style::new().green().bold(),
        UploadStatus::Error => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Imprime um valor em JSON sob um título colorido.
pub fn print_record<T: Serialize>(title: &str, style: &Style, value: &T) {
    println!("{}", style.apply_to(format!("─── {title} ───")));
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

pub fn print_job(job: &Job) {
    print_record("Task", &job_style(job.status), job);
}

pub fn print_upload(report: &UploadReport) {
    print_record("Upload", &upload_style(report.status), report);
}
