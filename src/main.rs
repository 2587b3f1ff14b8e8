use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use metrika_score::app::App;
use metrika_score::cli::{Cli, Command, CounterArgs};
use metrika_score::config::ScoreConfig;
use metrika_score::formatter::Conversion;
use metrika_score::metrika::CounterAuth;
use metrika_score::orchestrator::MAX_PAGE_LIMIT;
use metrika_score::state_machine::{JobStatus, TaskParams, UploadStatus};
use metrika_score::ui::{self, JobProgress};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);
const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScoreConfig::load(cli.config.as_deref())?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let app = App::from_config(&config).await?;
    let outcome = run(&app, &config, cli.command).await;
    app.shutdown();
    outcome
}

fn resolve_auth(args: CounterArgs, config: &ScoreConfig) -> Result<CounterAuth> {
    let token = args.token.unwrap_or_else(|| config.token.clone());
    let Some(counter) = args.counter.or(config.counter) else {
        bail!("no counter given: pass --counter or set METRIKA_COUNTER");
    };
    if token.is_empty() {
        bail!("no token given: pass --token or set METRIKA_TOKEN");
    }
    Ok(CounterAuth::new(counter, token))
}

async fn run(app: &App, config: &ScoreConfig, command: Command) -> Result<()> {
    match command {
        Command::Score { date, auth, output } => {
            let auth = resolve_auth(auth, config)?;
            let params = TaskParams::new(date.as_str(), auth.token, auth.counter)?;
            let job = app.jobs.create_job(params).await?;

            let progress = JobProgress::start(&format!("Scoring {date} for counter {}", auth.counter));
            let job = app
                .jobs
                .wait_until_finished(&job.id, JOB_POLL_INTERVAL, |j| progress.update(j))
                .await?;
            progress.complete(&job);
            if job.status != JobStatus::Done {
                bail!("task {} failed", job.id);
            }
            if let Some(path) = output {
                write_results(app, &job.id, &path).await?;
            }
        }
        Command::JobStatus { task_id } => {
            ui::print_job(&app.jobs.job_status(&task_id).await?);
        }
        Command::JobResult {
            task_id,
            limit,
            offset,
        } => {
            let page = app.jobs.job_result(&task_id, limit, offset).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::UploadBulk {
            task_id,
            target,
            auth,
        } => {
            let auth = resolve_auth(auth, config)?;
            ui::print_upload(&app.uploads.submit_bulk(&task_id, &target, auth).await?);
        }
        Command::UploadSingle {
            target,
            date_time,
            client_id,
            user_id,
            yclid,
            purchase_id,
            price,
            currency,
            auth,
        } => {
            let auth = resolve_auth(auth, config)?;
            let conversion = Conversion {
                client_id,
                user_id,
                yclid,
                purchase_id,
                target,
                date_time,
                price,
                currency,
            };
            ui::print_upload(&app.uploads.submit_single(&conversion, auth).await?);
        }
        Command::UploadStatus { upload_id } => {
            ui::print_upload(&app.uploads.upload_status(&upload_id).await?);
        }
        Command::TaskUploads { task_id } => {
            let reports = app.uploads.uploads_for_task(&task_id).await?;
            if reports.is_empty() {
                println!("no uploads for task {task_id}");
            }
            for report in &reports {
                ui::print_upload(report);
            }
        }
        Command::WebhookRegister { name, auth } => {
            let auth = resolve_auth(auth, config)?;
            let registration = app
                .webhooks
                .register(&name, auth.counter, &auth.token)
                .await?;
            println!("{}", serde_json::to_string_pretty(&registration)?);
        }
        Command::WebhookSubmit {
            webhook_id,
            secret,
            file,
            wait,
        } => {
            let conversions = read_conversions(&file)?;
            let accepted = app
                .webhooks
                .accept(&webhook_id, Some(&secret), conversions)
                .await?;
            println!("{}", serde_json::to_string_pretty(&accepted)?);
            let report = app
                .webhooks
                .deliver(&webhook_id, Some(&secret), &accepted.batch_id)
                .await?;
            ui::print_upload(&report);
            if wait && !matches!(report.status, UploadStatus::Completed | UploadStatus::Error) {
                wait_for_batch(app, &webhook_id, &secret, &accepted.batch_id).await?;
            }
        }
        Command::WebhookStatus {
            webhook_id,
            batch_id,
            secret,
        } => {
            let report = app
                .webhooks
                .batch_status(&webhook_id, Some(&secret), &batch_id)
                .await?;
            ui::print_upload(&report);
        }
    }
    Ok(())
}

async fn write_results(app: &App, task_id: &str, path: &Path) -> Result<()> {
    let mut results = Vec::new();
    let mut offset = 0;
    loop {
        let page = app.jobs.job_result(task_id, MAX_PAGE_LIMIT, offset).await?;
        offset += page.results.len();
        results.extend(page.results);
        if !page.pagination.has_more {
            break;
        }
    }
    let json = serde_json::to_string_pretty(&results)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    println!("  {} visits written to {}", results.len(), path.display());
    Ok(())
}

fn read_conversions(path: &Path) -> Result<Vec<Conversion>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Keep the process alive until the batch settles so reconciliation can finish.
async fn wait_for_batch(app: &App, webhook_id: &str, secret: &str, batch_id: &str) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted; batch {batch_id} keeps its last stored status");
                return Ok(());
            }
            _ = tokio::time::sleep(BATCH_POLL_INTERVAL) => {}
        }
        let report = app
            .webhooks
            .batch_status(webhook_id, Some(secret), batch_id)
            .await?;
        let settled = matches!(report.status, UploadStatus::Completed | UploadStatus::Error);
        if settled || (report.status != UploadStatus::Pending && report.remaining_attempts == 0) {
            ui::print_upload(&report);
            return Ok(());
        }
    }
}
