mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use config::{load_config, Config, ConfigError, ConfigFormat};
use qkd_backing_store::{BackingStore, BackingStoreFactory};
use qkd_keystore::KeyStoreFactory;
use qkd_site_agent::{DeviceFactory, SiteAgent, SiteAgentApi, SiteAgentError, SiteAgentPeer, SiteDetailsApi};
use qkd_telemetry::TelemetryHandle;
use qkd_types::SiteId;

#[derive(Debug, Parser)]
#[command(name = "qkd-agentd", version, about = "QKD site agent process")]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/qkd-agentd.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
}

/// No transport is bundled with this workspace (spec non-goal: service
/// discovery / RPC plumbing lives with the consumer). This stand-in always
/// reports the far side unreachable so the binary can still start up and
/// serve local-only operations (key store inspection, device registration)
/// without a peer configured.
struct UnconfiguredPeer;

impl SiteAgentPeer for UnconfiguredPeer {
    fn prep_hop(&self, _site: &SiteId, _device_id: &str, _origin: &SiteId) -> Result<String, SiteAgentError> {
        Err(SiteAgentError::SessionFailed(
            "no transport configured for remote site agents in this build".into(),
        ))
    }
}

fn exit_for_config_error(err: ConfigError) -> ! {
    match err {
        ConfigError::Io { .. } => {
            eprintln!("{err}");
            std::process::exit(10);
        }
        ConfigError::Parse { .. } | ConfigError::Validation(_) => {
            eprintln!("{err}");
            std::process::exit(11);
        }
    }
}

fn run(config: Config) -> Result<()> {
    let backing: Arc<dyn BackingStore> =
        Arc::from(BackingStoreFactory::from_url(&config.site.backing_store_url).wrap_err("opening backing store")?);
    let keystore_factory = Arc::new(KeyStoreFactory::new(backing));
    let device_factory = Arc::new(DeviceFactory::new());
    let telemetry = TelemetryHandle::from_config(config.telemetry.clone());

    let site_address = SiteId::parse(&config.site.listen_address).wrap_err("parsing site.listen-address")?;
    let agent = SiteAgent::new(
        site_address,
        Vec::new(),
        device_factory,
        keystore_factory,
        Arc::new(UnconfiguredPeer),
    );

    let details = agent.get_site_details();
    log::info!(
        "site {} ({}) ready; {} device url(s) configured (hardware drivers load out-of-process), {} static hop(s), {} registered device(s)",
        config.site.id,
        details.site,
        config.site.device_urls.len(),
        config.site.static_hops.len(),
        details.device_ids.len(),
    );

    if !config.site.static_hops.is_empty() {
        if let Err(err) = agent.start_node(&config.site.static_hops) {
            log::error!("failed to start configured static hops: {err}");
        }
    }

    let snapshot = telemetry.flush();
    log::debug!("telemetry snapshot at startup: {} counter(s)", snapshot.counters.len());
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let cli = Cli::parse();
    let config = match load_config(&cli.config, cli.config_format) {
        Ok(config) => config,
        Err(err) => exit_for_config_error(err),
    };

    match run(config) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::error!("{err:?}");
            std::process::exit(99);
        }
    }
}
