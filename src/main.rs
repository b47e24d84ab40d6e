use std::{process, sync::Arc};

use razzo::{
    CacheError,
    config::{self, Command, PreloadArgs, PurgeArgs, Settings, StatusArgs},
    hooks::Hooks,
    preload::{HttpFetcher, PageFetcher, PreloadScheduler, SitemapSource},
    purge::{Invalidator, PurgeRequest, PurgeScope, PurgeState, TemplateResolver},
    rules::{RuleEngine, RuleSet},
    store::PageStore,
    telemetry,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("purge failed: {0}")]
    PurgeFailed(String),
    #[error("no sitemap configured; pass --sitemap or set `preload.sitemap_url`")]
    NoSitemap,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging).map_err(AppError::Telemetry)?;

    match args
        .command
        .unwrap_or_else(|| Command::Status(StatusArgs::default()))
    {
        Command::Purge(purge) => run_purge(&settings, &purge).await,
        Command::Preload(preload) => run_preload(&settings, &preload).await,
        Command::Status(_) => run_status(&settings).await,
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<PageStore>, AppError> {
    Ok(Arc::new(
        PageStore::open(&settings.cache.root_dir, &settings.cache.domain).await?,
    ))
}

fn build_engine(settings: &Settings) -> Arc<RuleEngine> {
    let rules = RuleSet::compile(&settings.rules, &settings.cdn.reject_files);
    Arc::new(RuleEngine::new(
        rules,
        settings.cache.cache_mobile,
        settings.cache.cache_ssl,
        Arc::new(Hooks::default()),
    ))
}

async fn run_purge(settings: &Settings, args: &PurgeArgs) -> Result<(), AppError> {
    let store = open_store(settings).await?;
    let resolver = Arc::new(TemplateResolver::new(&settings.resolver.unit_path_template));
    let invalidator = Invalidator::new(Arc::clone(&store), resolver, Arc::new(Hooks::default()));

    let scope = if args.all {
        PurgeScope::All
    } else if let Some(url) = args.url.as_ref() {
        PurgeScope::Url(url.clone())
    } else if let Some(unit) = args.unit {
        PurgeScope::ContentUnit(unit)
    } else if let Some(lang) = args.lang.as_ref() {
        PurgeScope::Locale(lang.clone())
    } else {
        PurgeScope::All
    };

    let outcome = invalidator.purge(PurgeRequest::new(scope, "cli")).await;
    for failure in &outcome.errors {
        error!(error = %failure, "purge target failed");
    }
    println!(
        "purge state={} entries_removed={} duration_ms={}",
        outcome.state.as_str(),
        outcome.entries_removed,
        outcome.duration.as_millis()
    );

    if args.minified {
        let removed = store.purge_minified().await?;
        println!("purge-minified removed={removed}");
    }

    if outcome.state == PurgeState::Failed {
        return Err(AppError::PurgeFailed(outcome.errors.join("; ")));
    }
    Ok(())
}

async fn run_preload(settings: &Settings, _args: &PreloadArgs) -> Result<(), AppError> {
    if !settings.cache.enabled {
        info!(domain = %settings.cache.domain, "caching disabled; preload skipped");
        println!("preload state=skipped");
        return Ok(());
    }
    let sitemap_url = settings
        .preload
        .sitemap_url
        .clone()
        .ok_or(AppError::NoSitemap)?;

    let store = open_store(settings).await?;
    let engine = build_engine(settings);
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(settings.preload.timeout)?);
    let scheduler = PreloadScheduler::new(
        store,
        engine,
        Arc::clone(&fetcher),
        settings.preload.clone(),
    );
    let source = SitemapSource::new(fetcher, sitemap_url);

    let status = scheduler.run_to_completion(&source).await?;
    println!(
        "preload state={} warmed={} failed={} total={}",
        status.state.as_str(),
        status.warmed,
        status.failed,
        status.total
    );
    Ok(())
}

async fn run_status(settings: &Settings) -> Result<(), AppError> {
    let store = open_store(settings).await?;
    let entries = store.entry_count().await?;
    println!(
        "status domain={} enabled={} entries={} root={}",
        settings.cache.domain,
        settings.cache.enabled,
        entries,
        settings.cache.root_dir.display()
    );
    Ok(())
}
