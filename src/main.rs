use std::{process, sync::Arc};

use pagecache::{
    cache::{EntryStore, RenderedCache},
    config::{self, ClearArgs, SweepArgs, VersionsArgs},
    infra::{
        content::ContentRoot,
        error::InfraError,
        http::{self, CacheState, HttpState},
        telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep(args) => run_sweep(settings, args).await,
        config::Command::Clear(args) => run_clear(settings, args).await,
        config::Command::Versions(args) => run_versions(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let cache = RenderedCache::new(settings.cache.rendered_config())?;
    info!(
        cache_dir = %cache.current_dir().display(),
        version = %settings.cache.app_version,
        layout = ?settings.cache.layout,
        "rendered cache ready"
    );

    let state = HttpState::new(ContentRoot::new(settings.content.root.clone()));
    let cache_state = CacheState {
        cache: Arc::new(cache),
        max_body_bytes: settings.server.max_body_bytes,
    };
    let router = http::build_router(state, Some(cache_state));

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(addr = %settings.server.addr, "listening");

    let shutdown = Arc::new(Notify::new());
    let trigger = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { trigger.notified().await });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return server_result(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
    }

    shutdown.notify_one();
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out; aborting open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), InfraError> {
    match joined {
        Ok(result) => result.map_err(InfraError::from),
        Err(err) => Err(InfraError::from(err)),
    }
}

async fn run_sweep(settings: config::Settings, args: SweepArgs) -> Result<(), InfraError> {
    let store_config = settings.store.entry_store_config(settings.environment);
    let storage_name = args.storage_name;
    let removed = tokio::task::spawn_blocking(move || {
        EntryStore::open(store_config, &storage_name)?.delete_expired()
    })
    .await??;

    info!(removed, "sweep completed");
    Ok(())
}

async fn run_clear(settings: config::Settings, args: ClearArgs) -> Result<(), InfraError> {
    let rendered = settings.cache.rendered_config();
    let key = args.key.clone();
    let version = args.target_version.clone();
    let removed = tokio::task::spawn_blocking(move || {
        let cache = RenderedCache::new(rendered)?;
        match key.as_deref() {
            Some(key) => cache.delete(key, version.as_deref()),
            None => cache.clear(version.as_deref()),
        }
    })
    .await??;

    info!(
        key = args.key.as_deref().unwrap_or("*"),
        version = args
            .target_version
            .as_deref()
            .unwrap_or(&settings.cache.app_version),
        removed,
        "clear completed"
    );
    Ok(())
}

async fn run_versions(settings: config::Settings, args: VersionsArgs) -> Result<(), InfraError> {
    let mut rendered = settings.cache.rendered_config();
    if let Some(directory) = args.directory {
        rendered.directory = directory;
    }

    let versions =
        tokio::task::spawn_blocking(move || RenderedCache::new(rendered)?.versions()).await??;
    for version in versions {
        println!("{version}");
    }
    Ok(())
}
