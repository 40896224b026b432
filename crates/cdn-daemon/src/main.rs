// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use cdn_bundler::{BundlerDriver, SimpleJsBundler};
use cdn_config::{apply_env_overrides, load_config, validate_config};
use cdn_daemon::{build_app, AppState};
use cdn_installer::{Installer, NpmInstaller};
use cdn_orchestrator::spawn;
use cdn_registry::NpmRegistryFetch;
use cdn_store::{LocalFsStore, LocalMetaStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cdn-daemon", version, about = "HTTP control plane for the CDN build service")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Directory build artifacts are written under.
    #[arg(long, default_value = "./cdn-daemon-data/artifacts")]
    artifacts_dir: PathBuf,

    /// Directory per-fingerprint metadata is written under.
    #[arg(long, default_value = "./cdn-daemon-data/meta")]
    meta_dir: PathBuf,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// npm-compatible registry to install packages against.
    #[arg(long, default_value = "https://registry.npmjs.org")]
    registry: String,

    /// Package manager binary to shell out to.
    #[arg(long, default_value = "npm")]
    package_manager: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { EnvFilter::new("cdn=debug,cdn.daemon=debug") } else { EnvFilter::new("cdn=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = load_config(args.config.as_deref()).context("load config")?;
    apply_env_overrides(&mut config);
    for warning in validate_config(&config).context("validate config")? {
        tracing::warn!(target: "cdn.daemon", %warning, "configuration warning");
    }

    tokio::fs::create_dir_all(&args.artifacts_dir).await.context("create artifacts dir")?;
    tokio::fs::create_dir_all(&args.meta_dir).await.context("create meta dir")?;

    let fetch: Arc<dyn cdn_registry::PkgFetch> = Arc::new(NpmRegistryFetch::new(args.registry));
    let installer = Installer::with_retry_policy(
        Arc::new(NpmInstaller::new().with_program(args.package_manager)),
        config.install_max_attempts,
        std::time::Duration::from_millis(config.install_retry_pause_ms),
    );
    let bundler_driver = BundlerDriver::new(SimpleJsBundler::new());
    let fs: Arc<dyn cdn_store::FsStore> = Arc::new(LocalFsStore::new(args.artifacts_dir.clone()));
    let meta_store = Arc::new(LocalMetaStore::new(args.meta_dir.clone()));

    let queue = spawn(fetch, installer, bundler_driver, fs.clone(), meta_store, config.clone());
    let state = Arc::new(AppState { queue, fs, config });

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "cdn-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
