use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use domwatch::{
    build_sinks, open_watermark_store, utils::parse_address, worker::EngineSettings,
    CachedResolver, ContractDomainResolver, Normalizer, ReconciliationEngine, RpcChainAdapter,
    Settings, SinkDispatcher,
};

/// sysexits EX_CONFIG
const EXIT_CONFIG: u8 = 78;

#[tokio::main()]
async fn main() -> ExitCode {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("Failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let contract = parse_address(&settings.chain.contract_address)
        .context("Invalid registry contract address")?;

    let adapter = Arc::new(
        RpcChainAdapter::new(&settings.chain, settings.ingestion.poll_interval())
            .context("Failed to build chain adapter")?,
    );
    let resolver = Arc::new(CachedResolver::new(Arc::new(ContractDomainResolver::new(
        contract,
        adapter.clone(),
    ))));
    let normalizer = Normalizer::new(
        adapter.clone(),
        resolver,
        settings.ingestion.resolver_timeout(),
        settings.ingestion.timestamp_timeout(),
    );

    let store = open_watermark_store(&settings.storage)
        .await
        .context("Failed to open watermark store")?;

    let sink_set = build_sinks(&settings.sinks, contract)
        .await
        .context("Failed to initialize sinks")?;
    let (dispatch, dispatcher) = SinkDispatcher::new(sink_set.sinks, &settings.sinks);

    let engine = ReconciliationEngine::new(
        adapter,
        normalizer,
        Arc::new(dispatch),
        store,
        EngineSettings::from_settings(&settings)?,
    );

    let cancellation_token = CancellationToken::new();
    // Sinks outlive the engine so records emitted while it stops still drain.
    let sinks_token = CancellationToken::new();

    let push_handle = sink_set.push_server.map(|server| {
        let token = sinks_token.child_token();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("Push server failed: {:#}", e);
            }
        })
    });

    let dispatcher_token = sinks_token.child_token();
    let dispatcher_handle = tokio::spawn(async move {
        if let Err(e) = dispatcher.run(dispatcher_token).await {
            error!("Sink dispatcher failed: {:#}", e);
        }
    });

    let engine_token = cancellation_token.child_token();
    let mut engine_handle = tokio::spawn(async move { engine.run(engine_token).await });

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Watching {} on chain {}. Press Ctrl+C to stop.", contract, settings.chain.chain_id);

    #[cfg(unix)]
    let sigterm = sigterm_stream.recv();
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<Option<()>>();

    // The engine only returns on its own when it cannot start.
    let engine_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            None
        },
        _ = sigterm => {
            info!("Received SIGTERM, exiting gracefully...");
            None
        },
        result = &mut engine_handle => Some(result),
    };

    info!("Finishing all tasks...");
    cancellation_token.cancel();

    let engine_result = match engine_result {
        Some(result) => result,
        None => engine_handle.await,
    };

    sinks_token.cancel();

    info!("Waiting for sink dispatcher to drain...");
    let _ = dispatcher_handle.await;
    if let Some(handle) = push_handle {
        let _ = handle.await;
    }

    engine_result.context("Engine task panicked")??;
    info!("Shutdown complete");
    Ok(())
}
