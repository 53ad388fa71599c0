//! kube-sidecar-injector - a mutating admission webhook for pods.
//!
//! This is the main entry point that:
//! - Loads configuration (YAML file, then flags and environment)
//! - Initializes structured logging
//! - Issues the webhook's TLS certificate from a freshly generated CA
//! - Registers the webhook with the API server
//! - Serves admission requests, health probes and metrics

use std::error::Error as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::{Api, Client};
use tokio::signal;
use tracing::{error, info, warn};

use kube_sidecar_injector::cert::CertificateAuthority;
use kube_sidecar_injector::config::{Config, LogConfig, LogMode};
use kube_sidecar_injector::health::{HealthState, run_health_server};
use kube_sidecar_injector::webhooks::{
    RegistrationError, SHUTDOWN_GRACE_PERIOD, WebhookRegistration, WebhookState,
    run_webhook_server,
};
use kube_sidecar_injector::error::task_result;
use kube_sidecar_injector::{Error, MutationEngine, Result};

/// Upper bound for registering the webhook configuration at startup
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "kube-sidecar-injector", version, about)]
struct Cli {
    /// Path to the YAML configuration file; a missing file means defaults
    #[arg(
        long,
        global = true,
        env = "KUBE_SIDECAR_INJECTOR_CONFIG_FILE",
        default_value = "/etc/kube-sidecar-injector/config.yaml"
    )]
    config_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_LOG_MODE", value_enum)]
    log_mode: Option<LogMode>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the webhook server (default)
    Serve,
    /// Print the effective configuration as YAML
    DumpConfig,
}

/// Settings that take precedence over the configuration file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Namespace the injector's service lives in
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_NAMESPACE")]
    namespace: Option<String>,

    /// Name of the injector's service
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_SERVICE_NAME")]
    service_name: Option<String>,

    /// Port of the injector's service
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_SERVICE_PORT_NUMBER")]
    service_port_number: Option<u16>,

    /// Name of the MutatingWebhookConfiguration to manage
    #[arg(
        long,
        global = true,
        env = "KUBE_SIDECAR_INJECTOR_MUTATING_WEBHOOK_CONFIGURATION_NAME"
    )]
    mutating_webhook_configuration_name: Option<String>,

    /// Domain used in webhook names and pod annotations
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_ORG_DOMAIN")]
    org_domain: Option<String>,

    /// Address the TLS webhook server listens on
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// Path answering plain health checks on the webhook server
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_PATH_HEALTHCHECK")]
    path_healthcheck: Option<String>,

    /// Base path of the admission endpoints
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_PATH_WEBHOOK")]
    path_webhook: Option<String>,

    /// Address of the probe and metrics server
    #[arg(long, global = true, env = "KUBE_SIDECAR_INJECTOR_METRICS_LISTEN_ADDRESS")]
    metrics_listen_address: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        let k8s = &mut config.k8s;
        let server = &mut config.server;
        override_with(&mut k8s.namespace, self.namespace);
        override_with(&mut k8s.service_name, self.service_name);
        override_with(&mut k8s.service_port_number, self.service_port_number);
        override_with(
            &mut k8s.mutating_webhook_configuration_name,
            self.mutating_webhook_configuration_name,
        );
        override_with(&mut k8s.org_domain, self.org_domain);
        override_with(&mut server.listen_address, self.listen_address);
        override_with(&mut server.path_healthcheck, self.path_healthcheck);
        override_with(&mut server.path_webhook, self.path_webhook);
        override_with(&mut server.metrics_listen_address, self.metrics_listen_address);
    }
}

fn override_with<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Injector failed");
            eprintln!("Error: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_optional_file(&cli.config_file)?;
    cli.overrides.apply(&mut config);
    override_with(&mut config.log.level, cli.log_level);
    override_with(&mut config.log.mode, cli.log_mode);

    match cli.command.unwrap_or(Command::Serve) {
        Command::DumpConfig => {
            print!("---\n{}", config.to_yaml()?);
            Ok(())
        }
        Command::Serve => {
            init_tracing(&config.log)?;
            serve(config).await
        }
    }
}

fn init_tracing(log: &LogConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(format!(
            "warn,kube_sidecar_injector={level},kube={level}",
            level = log.level
        ))
        .map_err(|e| Error::LogFilter(e.to_string()))
    })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.mode {
        LogMode::Prod => builder.json().init(),
        LogMode::Dev => builder.init(),
    }
    Ok(())
}

fn parse_addr(address: &str) -> Result<SocketAddr> {
    address.parse().map_err(|source| Error::Address {
        address: address.to_string(),
        source,
    })
}

async fn serve(config: Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting kube-sidecar-injector");

    // kube and axum-server both link rustls; pick the provider once per process
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let registry = Arc::new(config.validate()?);
    for rule in registry.iter() {
        info!(
            rule = %rule.display_name(),
            fingerprint = %rule.fingerprint(),
            path = %config.server.webhook_path(rule.fingerprint()),
            "Loaded inject rule"
        );
    }

    let ca = CertificateAuthority::new(config.k8s.org_domain.clone(), config.k8s.service_hosts())?;
    let tls = ca.issue_leaf()?;

    // Probes and metrics come up first so the pod is observable while registering
    let health_state = Arc::new(HealthState::new());
    let metrics_addr = parse_addr(&config.server.metrics_listen_address)?;
    let mut health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move { run_health_server(health_state, metrics_addr).await })
    };

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");
    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    let registration = WebhookRegistration {
        registry: registry.as_ref(),
        k8s: &config.k8s,
        server: &config.server,
        ca_bundle: tls.ca_pem(),
    };
    tokio::time::timeout(REGISTRATION_TIMEOUT, registration.reconcile(&api))
        .await
        .map_err(|_| RegistrationError::Timeout {
            name: config.k8s.mutating_webhook_configuration_name.clone(),
        })??;

    let engine = MutationEngine::new(registry.clone(), config.k8s.annotation_prefix());
    let state = Arc::new(WebhookState::new(engine, Some(health_state.clone())));
    let handle = axum_server::Handle::new();
    let mut webhook_handle = {
        let handle = handle.clone();
        let server = config.server.clone();
        tokio::spawn(async move { run_webhook_server(state, &server, &tls, handle).await })
    };

    // Only report ready once the TLS listener is bound; setup errors end the task first
    tokio::select! {
        bound = handle.listening() => match bound {
            Some(addr) => {
                health_state.set_ready(true).await;
                info!(%addr, "Injector ready");
            }
            None => return task_result("webhook server", webhook_handle.await),
        },
        result = &mut webhook_handle => {
            return task_result("webhook server", result);
        }
    }

    tokio::select! {
        result = &mut webhook_handle => {
            return task_result("webhook server", result);
        }
        result = &mut health_handle => {
            task_result("health server", result)?;
            warn!("Health server stopped unexpectedly");
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    // Stop receiving new admission requests and drain in-flight ones
    health_state.set_ready(false).await;
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    task_result("webhook server", webhook_handle.await)?;

    info!("Injector stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
