#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use apm_extension_core::{
    config::ExtensionConfig,
    coordinator::InvocationCoordinator,
    error::ExtensionError,
    lifecycle::LifecycleClient,
    logger,
    logsapi::{self, EventType as LogsEventType, LogsDispatch},
    metadata::MetadataCache,
    receiver, transport::ApmServerTransport,
    EXTENSION_VERSION,
};

/// Prefix on every log line, to separate extension output from function
/// output in CloudWatch.
const LOG_PREFIX: &str = "APM_EXTENSION";

/// The extensions API matches on the file name of the deployed binary.
fn extension_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(std::path::Path::new)
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "apm-lambda-extension".to_string())
}

fn init_tracing(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .event_format(logger::Formatter::with_prefix(LOG_PREFIX))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("{LOG_PREFIX} | WARN | logging subsystem was already initialized");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Config must exist before logging so the level is honored; config
    // errors are reported on the fallback subscriber below.
    let config = match ExtensionConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            init_tracing("info");
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_level);
    info!("Starting apm-lambda-extension {EXTENSION_VERSION}");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match run(config, &shutdown).await {
        Ok(()) => {
            info!("Exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, exiting"),
            () = sigterm => info!("Received SIGTERM, exiting"),
        }
        shutdown.cancel();
    });
}

async fn run(
    config: Arc<ExtensionConfig>,
    shutdown: &CancellationToken,
) -> Result<(), ExtensionError> {
    // Register with the extensions API first; nothing else matters if the
    // host will not talk to us.
    let mut lifecycle = LifecycleClient::new(&config.runtime_api);
    let registration = match lifecycle.register(&extension_name()).await {
        Ok(registration) => registration,
        Err(err) => {
            if let Err(report) = lifecycle.init_error(&err.to_string()).await {
                error!("Failed to report init error to the host: {report}");
            }
            return Err(err);
        }
    };
    info!(
        "Registered for function {} ({})",
        registration.function_name, registration.function_version
    );

    let transport = Arc::new(ApmServerTransport::new(Arc::clone(&config)));
    let metadata = Arc::new(MetadataCache::new());
    let logs = Arc::new(LogsDispatch::new());

    let agent_receiver = match receiver::start_receiver(
        &config,
        Arc::clone(&transport),
        Arc::clone(&metadata),
        shutdown.clone(),
    )
    .await
    {
        Ok(agent_receiver) => agent_receiver,
        Err(err) => {
            if let Err(report) = lifecycle.init_error(&err.to_string()).await {
                error!("Failed to report init error to the host: {report}");
            }
            return Err(err);
        }
    };
    info!("Agent data receiver listening on {}", agent_receiver.addr);

    // The logs pipeline is optional: some environments have no Logs API, and
    // the extension still forwards agent data without it.
    match logsapi::start_logs_receiver(
        &config,
        Arc::clone(&logs),
        Arc::clone(&transport),
        Arc::clone(&metadata),
        shutdown.clone(),
    )
    .await
    {
        Ok(logs_receiver) => {
            let extension_id = lifecycle.extension_id().unwrap_or_default().to_string();
            match logsapi::subscribe(
                &config.runtime_api,
                &extension_id,
                &[LogsEventType::Platform],
                &logs_receiver.destination_uri,
            )
            .await
            {
                Ok(()) => info!("Subscribed to the Lambda Logs API"),
                Err(err) => warn!("Error while subscribing to the Logs API: {err}"),
            }
        }
        Err(err) => warn!("Could not start the logs receiver: {err}"),
    }

    let mut coordinator = InvocationCoordinator::new(config, lifecycle, transport, logs);
    coordinator.run(shutdown).await
}
