// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use cdn_bundler::{BundlerDriver, SimpleJsBundler};
use cdn_config::{load_config, validate_config};
use cdn_core::{BuildDescriptor, Package, Target};
use cdn_installer::{Installer, NpmInstaller};
use cdn_orchestrator::spawn;
use cdn_registry::NpmRegistryFetch;
use cdn_store::{FsStore, LocalFsStore, LocalMetaStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

/// Default upstream npm registry, used when neither `--registry` nor a
/// config file overrides it.
const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";

#[derive(Parser, Debug)]
#[command(name = "cdn", version, about = "CDN build service CLI: run a single local build")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a package specifier into a module bundle.
    Build {
        /// Registry-path specifier, e.g. `react@18.2.0` or
        /// `left-pad@1.3.0/index.js`.
        spec: String,

        /// Output ECMAScript profile.
        #[arg(long, default_value = "es2022")]
        target: String,

        /// Directory build artifacts are written under.
        #[arg(long, default_value = "./cdn-build-out")]
        out_dir: PathBuf,

        /// Path to a TOML config file. Falls back to defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// npm-compatible registry to install against.
        #[arg(long, default_value = DEFAULT_REGISTRY)]
        registry: String,

        /// Package manager binary to shell out to.
        #[arg(long, default_value = "npm")]
        package_manager: String,

        /// Produce a self-contained bundle instead of leaving bare imports
        /// unresolved against the CDN origin.
        #[arg(long)]
        bundle: bool,

        /// Skip minification of the emitted bundle.
        #[arg(long)]
        dev: bool,

        /// Write the artifact to this path instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Path to a TOML config file. Falls back to defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("cdn=debug") } else { EnvFilter::new("cdn=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Build { spec, target, out_dir, config, registry, package_manager, bundle, dev, output } => {
            cmd_build(spec, target, out_dir, config, registry, package_manager, bundle, dev, output).await
        }
        Commands::Config { config } => cmd_config(config),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn cmd_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_deref()).context("load config")?;
    for warning in validate_config(&config).context("validate config")? {
        eprintln!("warning: {warning}");
    }
    let toml = toml::to_string_pretty(&config).context("serialize config")?;
    println!("{toml}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_build(
    spec: String,
    target: String,
    out_dir: PathBuf,
    config_path: Option<PathBuf>,
    registry: String,
    package_manager: String,
    bundle: bool,
    dev: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref()).context("load config")?;
    for warning in validate_config(&config).context("validate config")? {
        eprintln!("warning: {warning}");
    }
    if bundle {
        // A single local build always runs single-threaded; the queue's
        // worker pool only matters once sub-builds start fanning out.
        config.worker_concurrency = config.worker_concurrency.max(1);
    }

    let target: Target = target.parse().with_context(|| format!("unknown target '{target}'"))?;
    let package = Package::parse(&spec, &config.pins.as_map()).with_context(|| format!("invalid package specifier '{spec}'"))?;

    let mut descriptor = BuildDescriptor::new(package, config.build_version, target);
    descriptor.bundle_mode = bundle;
    descriptor.dev_mode = dev;
    let descriptor = descriptor.canonicalize();

    std::fs::create_dir_all(&out_dir).with_context(|| format!("create out dir {}", out_dir.display()))?;

    let fetch: Arc<dyn cdn_registry::PkgFetch> = Arc::new(NpmRegistryFetch::new(registry));
    let installer = Installer::with_retry_policy(
        Arc::new(NpmInstaller::new().with_program(package_manager)),
        config.install_max_attempts,
        Duration::from_millis(config.install_retry_pause_ms),
    );
    let bundler_driver = BundlerDriver::new(SimpleJsBundler::new());
    let fs = Arc::new(LocalFsStore::new(out_dir.clone()));
    let meta_store = Arc::new(LocalMetaStore::new(out_dir.join(".meta")));

    let timeout = Duration::from_secs(config.consumer_timeout_secs);
    let queue = spawn(fetch, installer, bundler_driver, fs.clone(), meta_store, config);

    let consumer = queue.add(descriptor, "cdn-cli").await;
    let result = consumer.wait_with_timeout(timeout).await.context("build failed")?;

    let artifact = fs.read_file(&result.artifact_path).await.context("read finished artifact")?;

    match output {
        Some(path) => {
            std::fs::write(&path, &artifact).with_context(|| format!("write artifact to {}", path.display()))?;
            eprintln!("wrote {} ({} bytes)", path.display(), artifact.len());
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&artifact).context("write artifact to stdout")?;
        }
    }

    eprintln!(
        "build_id={} exports={} export_default={} cjs={}",
        result.build_id,
        result.meta.exports.join(","),
        result.meta.export_default,
        result.meta.cjs,
    );
    Ok(())
}
