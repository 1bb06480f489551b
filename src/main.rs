use std::{process, sync::Arc};

use pagehold::{
    cache::{
        CacheFacade, DirectorySizeProbe, DiskUsageProbe, FacadeState, PreloadQueue, StorageFactory,
        TagSet,
    },
    config::{self, Command, Settings},
    infra::{error::InfraError, telemetry, warmer::PreloadWarmer},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::PurgeUrl(args) => {
            build_facade(&settings).purge_url(&args.url);
            println!("purged {}", args.url);
        }
        Command::PurgeTag(args) => {
            let tags: TagSet = args.tags.into_iter().collect();
            build_facade(&settings).purge_tags(&tags);
            println!("purged {} tag(s)", tags.len());
        }
        Command::PurgeAll => {
            build_facade(&settings).purge_all();
            println!("purged all entries");
        }
        Command::Stats => print_stats(&settings),
        Command::WriteSnapshot(args) => {
            let path = args
                .path
                .unwrap_or_else(|| settings.cache.snapshot_path());
            settings.cache.snapshot().write(&path)?;
            println!("wrote {}", path.display());
        }
        Command::PreloadEnqueue(args) => {
            let queue = PreloadQueue::in_dir(&settings.cache.state_directory);
            let added = queue.enqueue(args.urls);
            println!("queued {added} url(s); {} pending", queue.len());
        }
        Command::PreloadRun(args) => run_preload(&settings, args.limit).await?,
        Command::Sweep => {
            let removed = build_facade(&settings).sweep_expired();
            println!("removed {removed} expired entr{}", if removed == 1 { "y" } else { "ies" });
        }
    }

    Ok(())
}

fn build_facade(settings: &Settings) -> Arc<CacheFacade> {
    let cache = &settings.cache;
    let backend = StorageFactory::create(cache.backend, &cache.backend_options());
    info!(backend = backend.name(), directory = %cache.directory.display(), "cache backend ready");
    Arc::new(CacheFacade::new(
        backend,
        FacadeState::persistent(cache.state_directory.clone()),
    ))
}

fn print_stats(settings: &Settings) {
    let state = FacadeState::persistent(settings.cache.state_directory.clone());
    let stats = state.stats();
    println!("hits:      {}", stats.hits);
    println!("misses:    {}", stats.misses);
    println!("hit ratio: {}", stats.ratio());

    match DiskUsageProbe::new(settings.cache.directory.clone()).total_bytes() {
        Ok(bytes) => println!("disk size: {bytes} bytes"),
        Err(err) => println!("disk size: unavailable ({err})"),
    }

    let purges = state.purges();
    if purges.is_empty() {
        println!("recent purges: none");
    } else {
        println!("recent purges:");
        for line in purges {
            println!("  {line}");
        }
    }
}

async fn run_preload(settings: &Settings, limit: Option<usize>) -> Result<(), InfraError> {
    let preload = &settings.cache.preload;
    let warmer = PreloadWarmer::new(
        &preload.user_agent,
        preload.timeout,
        preload.concurrency.get(),
    )?;
    let queue = PreloadQueue::in_dir(&settings.cache.state_directory);
    let report = warmer
        .run(&queue, limit.unwrap_or(preload.batch_size.get()))
        .await;

    println!(
        "warmed {} url(s), {} failed, {} still queued",
        report.warmed,
        report.failed.len(),
        queue.len()
    );
    Ok(())
}
