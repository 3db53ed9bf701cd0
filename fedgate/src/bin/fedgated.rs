// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fedgate.
//
// fedgate is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fedgate is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fedgate.  If not,
// see <http://www.gnu.org/licenses/>.


//! # fedgated
//!
//! The fedgate daemon: inbound ActivityPub deliveries & domain-permission administration.
//!
//! # Introduction
//!
//! `fedgated` listens on two addresses. The public one serves the inboxes (`/users/{username}/inbox`
//! & `/inbox`), the public list of domain blocks & a health check. The private one serves the admin
//! API. HTTP signatures are verified in front of us; the verifying proxy names the actor it
//! authenticated in the `x-authenticated-actor` header.
//!
//! Send it a `SIGHUP` to re-read the configuration file, a `SIGTERM` (or `^C`) to shut it down.

use std::{
    env,
    fmt::Display,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use axum::{routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;

use fedgate_shared::domain::Domain;

use fedgate::{
    admin::{self, as_instance_actor},
    domain_gate, domain_permissions,
    entities::{Account, AccountId},
    fedgate::Fedgate,
    http::trusted_actor,
    inbox,
    memory::InMemory,
    metrics::{check_metric_registrations, Instruments},
    side_effects::{self, drain, BoundedQueue},
    storage::Backend as StorageBackend,
};

/// The fedgated application error type
///
/// `main()` returns `Result<(), Error>`; should it return an `Err`, the Rust runtime prints it using
/// its `Debug` implementation. The derived `Debug` is neither readable nor brief, so `Debug` is
/// implemented by hand in terms of `Display`, below.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

/// An account known to this instance at startup
///
/// Actor resolution isn't our job; until something else populates storage, accounts are listed in
/// the configuration file.
#[derive(Clone, Debug, Deserialize)]
struct KnownAccount {
    username: String,
    /// Omit for local accounts
    domain: Option<Domain>,
    uri: Url,
}

impl From<&KnownAccount> for Account {
    fn from(value: &KnownAccount) -> Self {
        Account {
            id: AccountId::new(),
            username: value.username.clone(),
            domain: value.domain.clone(),
            uri: value.uri.clone(),
        }
    }
}

/// fedgated configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ConfigV1 {
    /// Local address at which to listen for public requests; specify as "address:port"
    public_address: SocketAddr,
    /// Address at which to listen for admin requests; specify as "address:port"
    private_address: SocketAddr,
    gate: domain_gate::Config,
    side_effects: side_effects::Config,
    domain_permissions: domain_permissions::Config,
    known_accounts: Vec<KnownAccount>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:20691".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20692".parse::<SocketAddr>().unwrap(/* known good */),
            gate: domain_gate::Config::default(),
            side_effects: side_effects::Config::default(),
            domain_permissions: domain_permissions::Config::default(),
            known_accounts: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the fedgated configuration file
///
/// If no file was named, try `/etc/fedgate.toml`, falling back to defaults if that isn't there.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/fedgate.toml").unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Build the formatting layer & filter for the global subscriber
///
///               | output           |
///  -------------+------------------+
///  --plain=false| json, to stdout  |
///  --plain=true | compact, stdout  |
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types, hence the box
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Fedgate>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(inbox::make_router())
        .merge(admin::make_public_router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            trusted_actor,
        ))
        .with_state(state)
}

/// Make the [Router] that will only be locally accessible
fn make_local_router(state: Arc<Fedgate>) -> Router {
    Router::new()
        .merge(admin::make_router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            as_instance_actor,
        ))
        .with_state(state)
}

/// Make sure every configured account, & the instance actor, is in storage
async fn seed_accounts(storage: &InMemory, cfg: &ConfigV1) {
    for known in &cfg.known_accounts {
        match storage.account_by_uri(&known.uri).await {
            Ok(Some(_)) => (),
            _ => storage.add_account(Account::from(known)).await,
        }
    }
    let instance = cfg.gate.host.to_string();
    if let Ok(None) = storage.local_account_by_username(&instance).await {
        match Url::parse(&format!("https://{}/users/{}", instance, instance)) {
            Ok(uri) => {
                storage
                    .add_account(Account {
                        id: AccountId::new(),
                        username: instance,
                        domain: None,
                        uri,
                    })
                    .await
            }
            Err(err) => warn!("Can't form an instance actor for {}: {}", instance, err),
        }
    }
}

/// Serve fedgate requests
///
/// Storage & the side-effect queue outlive configuration reloads; everything built from the
/// configuration (the gate's caches included) is rebuilt on each `SIGHUP`.
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let instruments = Arc::new(Instruments::default());
    let storage = Arc::new(InMemory::new());
    // The queue's capacity is fixed for the life of the process
    let (queue, receiver) = BoundedQueue::new(&cfg.side_effects, instruments.clone());
    let queue = Arc::new(queue);
    let drain_nfy = Arc::new(Notify::new());
    let drain_handle = drain(receiver, drain_nfy.clone(), instruments.clone());

    loop {
        seed_accounts(&storage, &cfg).await;
        let state = Arc::new(Fedgate::new(
            &cfg.gate,
            &cfg.domain_permissions,
            storage.clone(),
            queue.clone(),
            instruments.clone(),
        ));
        info!(
            "Serving {} in {}.",
            cfg.gate.host,
            state.gate.federation_mode()
        );

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let mut world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()))
        .into_future();

        let mut local_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()))
        .into_future();

        tokio::select! {
            // The servers should never shut down on their own
            res = &mut world_server => {
                error!("The public server exited unexpectedly: {:?}", res);
                local_nfy.notify_one();
                log_on_err(local_server.await);
                break;
            },
            res = &mut local_server => {
                error!("The private server exited unexpectedly: {:?}", res);
                world_nfy.notify_one();
                log_on_err(world_server.await);
                break;
            },
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                // Keep the last known-good configuration if the new one is broken
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{}; keeping the current configuration", err);
                        cfg
                    }
                };
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                break;
            },
        }
    }

    drain_nfy.notify_one();
    match tokio::time::timeout(std::time::Duration::from_secs(5), drain_handle).await {
        Ok(Err(err)) => error!("The side-effect drain failed: {:?}", err),
        Err(err) => error!("Timed-out waiting for the side-effect drain: {:?}", err),
        _ => (),
    }

    Ok(())
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        // Configure logging *before* calling `serve()`, since it's instrumented
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            check_metric_registrations();
            info!("fedgated version {} starting.", crate_version!());

            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("fedgated")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Inbound ActivityPub gating & ingestion")
            .long_about(
                "`fedgated` accepts ActivityPub deliveries, refuses those from blocked domains, \
                 and records the rest.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("FEDGATE_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FEDGATE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FEDGATE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FEDGATE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FEDGATE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Until the configuration file has been read, log to stderr
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config() {
        let cfg = toml::from_str::<Configuration>(
            r#"
version = "1"
public-address = "0.0.0.0:8080"
private-address = "127.0.0.1:8081"

[gate]
host = "local.example"
account-domain = "example.social"
federation-mode = "allowlist-mode"

[side-effects]
queue-capacity = 16

[[known-accounts]]
username = "alice"
domain = "remote.example"
uri = "https://remote.example/users/alice"
"#,
        )
        .unwrap();
        let Configuration::V1(cfg) = cfg;
        assert_eq!(cfg.public_address.port(), 8080);
        assert_eq!(
            cfg.gate.federation_mode,
            domain_gate::FederationMode::Allowlist
        );
        assert_eq!(cfg.side_effects.queue_capacity, 16);
        assert_eq!(cfg.known_accounts.len(), 1);
        assert_eq!(
            cfg.domain_permissions.draft_cache_capacity,
            domain_permissions::Config::default().draft_cache_capacity
        );
    }

    #[test]
    fn test_missing_default_config() {
        // An explicitly named file must exist
        assert!(parse_config(&Some(PathBuf::from("/no/such/fedgate.toml"))).is_err());
    }
}
