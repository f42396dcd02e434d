use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gleaner_client::HttpSourceFactory;
use gleaner_core::{
    AppError, DbConfig, EnrichConfig, EnrichmentService, HttpConfig, JobQueue, JobStatus,
    MemoryJobQueue, Phase, RetryPolicy, ScheduleConfig, Scheduler, SourceConfig, TaskRun,
    TracingReporter, TracingWorkerReporter, WorkerConfig, WorkerPool, enqueue_phase,
};
use gleaner_db::{EntityRepository, JobRepository, init_schema};

mod config;

use config::{Command, Config};

type Service = EnrichmentService<EntityRepository, HttpSourceFactory>;

/// Where jobs are queued.
enum Broker {
    Memory(MemoryJobQueue),
    Postgres(JobRepository),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::parse();

    info!("Connecting to database...");
    let db_config = DbConfig::from_env();
    let pool = connect(&config.database_url, &db_config).await?;
    let repo = EntityRepository::new(pool.clone());

    match config.command {
        Command::InitDb => {
            init_schema(&pool).await.map_err(friendly)?;
            if let Some(url) = separate_broker(config.broker_url.as_deref(), &config.database_url) {
                info!("Initializing job queue database...");
                let broker_pool = connect(url, &db_config).await?;
                init_schema(&broker_pool).await.map_err(friendly)?;
            }
            println!("Schema is up to date.");
        }
        Command::RunOnce { phase } => {
            let service = enrichment_service(repo.clone())?;
            let runs = run_once(&service, phase.map(Phase::from)).await;
            print_runs(&runs);
            show_stats(&repo).await?;

            let failed = runs.iter().filter(|r| r.is_failed()).count();
            if failed > 0 {
                anyhow::bail!("{} of {} phases failed", failed, runs.len());
            }
        }
        Command::Stats => show_stats(&repo).await?,
        Command::User { external_id } => show_user(&repo, external_id).await?,
        Command::Users { limit, offset } => list_users(&repo, limit, offset).await?,
        Command::Serve {
            workers,
            shutdown_timeout,
        } => {
            let service = enrichment_service(repo.clone())?;
            let timeout = Duration::from_secs(shutdown_timeout);
            match broker(config.broker_url.as_deref(), &pool, &db_config).await? {
                Broker::Memory(queue) => serve(queue, service, workers, true, timeout).await,
                Broker::Postgres(queue) => serve(queue, service, workers, true, timeout).await,
            }
        }
        Command::Worker {
            workers,
            shutdown_timeout,
        } => {
            let service = enrichment_service(repo.clone())?;
            let queue = shared_broker(config.broker_url.as_deref(), &pool, &db_config).await?;
            serve(queue, service, workers, false, Duration::from_secs(shutdown_timeout)).await;
        }
        Command::Enqueue { phase } => {
            let queue = shared_broker(config.broker_url.as_deref(), &pool, &db_config).await?;
            let phase = Phase::from(phase);
            match enqueue_phase(&queue, phase, "cli").await.map_err(friendly)? {
                Some(job) => println!("Enqueued {} job {}", phase, job.id),
                None => println!("A {} job is already pending or running", phase),
            }
        }
        Command::Jobs { status, limit } => {
            let queue = shared_broker(config.broker_url.as_deref(), &pool, &db_config).await?;
            list_jobs(&queue, status.map(JobStatus::from), limit).await?;
        }
    }

    Ok(())
}

/// Turns a library error into its operator-facing message.
fn friendly(e: AppError) -> anyhow::Error {
    anyhow::anyhow!(e.user_message())
}

async fn connect(url: &str, db_config: &DbConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

/// The broker URL, if it names a database other than the main one.
fn separate_broker<'a>(broker_url: Option<&'a str>, database_url: &str) -> Option<&'a str> {
    broker_url.filter(|url| *url != "memory" && *url != database_url)
}

async fn broker(
    broker_url: Option<&str>,
    pool: &PgPool,
    db_config: &DbConfig,
) -> anyhow::Result<Broker> {
    match broker_url {
        Some("memory") => Ok(Broker::Memory(MemoryJobQueue::new())),
        Some(url) => {
            let broker_pool = connect(url, db_config)
                .await
                .context("Failed to connect to the job queue database")?;
            Ok(Broker::Postgres(JobRepository::new(broker_pool)))
        }
        None => Ok(Broker::Postgres(JobRepository::new(pool.clone()))),
    }
}

/// A queue other processes can see.
async fn shared_broker(
    broker_url: Option<&str>,
    pool: &PgPool,
    db_config: &DbConfig,
) -> anyhow::Result<JobRepository> {
    match broker(broker_url, pool, db_config).await? {
        Broker::Postgres(queue) => Ok(queue),
        Broker::Memory(_) => anyhow::bail!(
            "BROKER_URL=memory is only visible inside `gleaner serve`; point BROKER_URL at PostgreSQL"
        ),
    }
}

fn enrichment_service(repo: EntityRepository) -> anyhow::Result<Service> {
    let enrich_config = EnrichConfig::from_env();
    let sources = HttpSourceFactory::new(SourceConfig::from_env(), HttpConfig::from_env())
        .map_err(friendly)
        .context("Failed to create HTTP sources")?
        .with_page_size(enrich_config.page_size);

    Ok(EnrichmentService::with_config(
        repo,
        sources,
        RetryPolicy::from_env(),
        enrich_config,
    ))
}

/// Runs one phase, or all of them in order, inline.
async fn run_once(service: &Service, phase: Option<Phase>) -> Vec<TaskRun> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Interrupted, stopping after the current record");
            cancel.cancel();
        })
    };

    let runs = match phase {
        Some(phase) => vec![
            service
                .run_phase_with_progress(phase, &TracingReporter, cancel)
                .await,
        ],
        None => service.run_cycle(&TracingReporter, cancel).await,
    };

    watcher.abort();
    runs
}

/// Runs workers, plus the scheduler when `with_scheduler`, until a shutdown
/// signal arrives.
async fn serve<Q: JobQueue + 'static>(
    queue: Q,
    service: Service,
    workers: usize,
    with_scheduler: bool,
    shutdown_timeout: Duration,
) {
    let cancel = CancellationToken::new();

    let mut scheduler = with_scheduler
        .then(|| Scheduler::new(queue.clone(), ScheduleConfig::from_env()).with_cancel_token(&cancel));
    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.start().await;
    }

    let pool = WorkerPool::new(queue, service, WorkerConfig::from_env(), workers);
    let handle = pool.spawn(cancel.clone(), TracingWorkerReporter, TracingReporter);
    info!(
        workers = handle.len(),
        scheduler = with_scheduler,
        "Gleaner running, press Ctrl+C to stop"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown...");
    cancel.cancel();

    let drain = async {
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        handle.join().await;
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "Workers did not stop in time, in-flight jobs stay running until released"
        );
    }

    info!("Shutdown complete");
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_runs(runs: &[TaskRun]) {
    println!();
    println!(
        "  {:<14} {:<10} {:>8} {:>8} {:>8} {:>7} {:>8} {:>9}",
        "PHASE", "STATE", "FETCHED", "CREATED", "UPDATED", "FAILED", "SKIPPED", "DURATION"
    );
    for run in runs {
        let duration = run
            .duration()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<14} {:<10} {:>8} {:>8} {:>8} {:>7} {:>8} {:>9}",
            run.phase.as_str(),
            run.state.as_str(),
            run.stats.fetched,
            run.stats.created,
            run.stats.updated,
            run.stats.failed,
            run.stats.skipped,
            duration
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
}

async fn show_stats(repo: &EntityRepository) -> anyhow::Result<()> {
    let stats = repo.get_stats().await.map_err(friendly)?;

    println!("\nDatabase Statistics\n");
    println!("  Users:                 {}", stats.total_users);
    println!("  Addresses:             {}", stats.total_addresses);
    println!("  Credit cards:          {}", stats.total_credit_cards);
    println!(
        "  With addresses:        {} ({:.2}%)",
        stats.users_with_addresses, stats.address_coverage
    );
    println!(
        "  With credit cards:     {} ({:.2}%)",
        stats.users_with_credit_cards, stats.credit_card_coverage
    );
    println!("  With both:             {}", stats.users_with_both);
    if let Some(last_update) = stats.last_update {
        println!("  Last update:           {}", last_update);
    }

    println!("\n  Phases:");
    for phase in &stats.phases {
        let last_success = phase
            .last_successful_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "    {:<14} last status: {:<10} last success: {}",
            phase.phase.as_str(),
            phase.last_status.as_deref().unwrap_or("-"),
            last_success
        );
    }
    println!();

    Ok(())
}

async fn show_user(repo: &EntityRepository, external_id: i64) -> anyhow::Result<()> {
    let Some(user) = repo
        .get_user_with_relations(external_id)
        .await
        .map_err(friendly)?
    else {
        anyhow::bail!("No user with external id {}", external_id);
    };

    let json = serde_json::to_string_pretty(&user).context("Failed to serialize user")?;
    println!("{}", json);
    Ok(())
}

async fn list_users(repo: &EntityRepository, limit: i64, offset: i64) -> anyhow::Result<()> {
    let users = repo.list_users(limit, offset).await.map_err(friendly)?;
    if users.is_empty() {
        eprintln!("No users found.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<28} {:<18} {:>9} {:>6}",
        "ID", "NAME", "USERNAME", "ADDRESSES", "CARDS"
    );
    for user in users {
        println!(
            "{:>6}  {:<28} {:<18} {:>9} {:>6}",
            user.external_id,
            truncate(&user.name, 28),
            truncate(&user.username, 18),
            user.address_count,
            user.credit_card_count
        );
    }
    Ok(())
}

async fn list_jobs<Q: JobQueue>(
    queue: &Q,
    status: Option<JobStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let jobs = queue.list_jobs(status, limit).await.map_err(friendly)?;
    if jobs.is_empty() {
        eprintln!("No jobs found.");
        return Ok(());
    }

    for job in jobs {
        let counts = job
            .run_stats
            .map(|s| {
                format!(
                    "fetched={} created={} updated={} failed={} skipped={}",
                    s.fetched, s.created, s.updated, s.failed, s.skipped
                )
            })
            .unwrap_or_default();
        println!(
            "{}  {:<12} {:<9} {:<9} {}  {}",
            job.id,
            job.phase.as_str(),
            job.status.as_str(),
            job.trigger,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            counts
        );
        if let Some(error) = job.error_message {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

/// Truncates text to `max_chars`, appending an ellipsis when cut.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
