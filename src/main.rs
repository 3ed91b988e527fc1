//! Fleet Volume Provisioner
//!
//! Runs once at instance boot: reuses or creates an EBS volume, attaches
//! it to this instance, formats it if blank and mounts it.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_volume_provisioner::{
    parse_tag, Config, Ec2ControlPlane, LinuxHost, MetadataClient, Orchestrator, Provisioner,
    Result, RunReport, TagQuery, Timeouts, VolumeType,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Attach a persistent volume from a tagged pool, creating one if needed
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tag key identifying the volume pool
    #[arg(long, env = "TAG_KEY")]
    tag_key: String,

    /// Tag value identifying the volume pool
    #[arg(long, env = "TAG_VALUE")]
    tag_value: String,

    /// Device name to attach as, e.g. xvdb
    #[arg(long, env = "ATTACH_AS")]
    attach_as: String,

    /// Directory to mount the volume on
    #[arg(long, env = "MOUNT_POINT")]
    mount_point: PathBuf,

    /// Size of a newly created volume in GiB
    #[arg(long, env = "CREATE_SIZE")]
    create_size: u32,

    /// Name tag of a newly created volume
    #[arg(long, env = "CREATE_NAME")]
    create_name: String,

    /// Volume type of a newly created volume
    #[arg(long, env = "CREATE_VOLUME_TYPE", value_enum)]
    create_volume_type: VolumeType,

    /// Extra KEY=VALUE tags for a newly created volume
    #[arg(long = "create-tags", value_parser = parse_tag)]
    create_tags: Vec<(String, String)>,

    /// Bytes per inode passed to mkfs
    #[arg(long, env = "MKFS_INODE_RATIO", default_value_t = fleet_volume_provisioner::config::DEFAULT_INODE_RATIO)]
    mkfs_inode_ratio: u64,

    /// Delete the volume when the instance terminates
    #[arg(long, env = "DELETE_ON_TERMINATION")]
    delete_on_termination: bool,

    /// Restore new volumes from the newest snapshot with this Name tag
    #[arg(long, env = "SNAPSHOT_NAME")]
    snapshot_name: Option<String>,

    /// Retries of the EC2 client for each request
    #[arg(long, env = "MAX_RETRIES", default_value_t = fleet_volume_provisioner::config::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Deadline for volume state changes, in seconds
    #[arg(long, default_value = "600")]
    volume_timeout_secs: u64,

    /// Deadline for the device node to appear, in seconds
    #[arg(long, default_value = "60")]
    device_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        let mut config = Config::new(
            TagQuery::new(self.tag_key.clone(), self.tag_value.clone()),
            self.attach_as.clone(),
            self.mount_point.clone(),
            self.create_size,
            self.create_name.clone(),
            self.create_volume_type,
        );
        config.create_tags = self.create_tags.iter().cloned().collect();
        config.mkfs_inode_ratio = self.mkfs_inode_ratio;
        config.delete_on_termination = self.delete_on_termination;
        config.snapshot_name = self.snapshot_name.clone().filter(|name| !name.is_empty());
        config.max_retries = self.max_retries;
        config.timeouts = Timeouts {
            volume_available: Duration::from_secs(self.volume_timeout_secs),
            volume_in_use: Duration::from_secs(self.volume_timeout_secs),
            device_node: Duration::from_secs(self.device_timeout_secs),
            ..Timeouts::default()
        };
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Fleet Volume Provisioner");
    info!("  Version: {}", fleet_volume_provisioner::VERSION);
    info!("  Tag: {}={}", args.tag_key, args.tag_value);
    info!("  Device: {}", args.attach_as);
    info!("  Mount point: {}", args.mount_point.display());

    match run(args.to_config()).await {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, "Provisioning complete"),
            Err(e) => info!("Provisioning complete ({})", e),
        },
        Err(e) => {
            error!(
                kind = e.kind(),
                leaked_volume = e.leaked_volume(),
                error = %e,
                "Provisioning failed"
            );
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<RunReport> {
    config.validate()?;

    let context = MetadataClient::new()?.instance_context().await?;
    info!(
        "Running on {} in {} ({})",
        context.instance_id, context.availability_zone, context.region
    );

    let control_plane = Ec2ControlPlane::connect(&context, config.max_retries).await;
    let provisioner = Provisioner::new(
        Arc::new(control_plane),
        Arc::new(LinuxHost::default()),
        context,
        config.timeouts,
    );

    let orchestrator = Orchestrator::new(config, Arc::new(provisioner));
    orchestrator.run().await
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["aws_config=warn", "aws_smithy_runtime=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "fleet-volume-provisioner",
            "--tag-key", "env",
            "--tag-value", "prod",
            "--attach-as", "xvdb",
            "--mount-point", "/data",
            "--create-size", "20",
            "--create-name", "prod-data",
            "--create-volume-type", "gp2",
            "--create-tags", "team=storage",
            "--create-tags", "cost=ops",
            "--snapshot-name", "",
            "--device-timeout-secs", "30",
        ]);

        let config = args.to_config();
        config.validate().unwrap();
        assert_eq!(config.create_volume_type, VolumeType::Gp2);
        assert_eq!(config.create_tags.len(), 2);
        assert_eq!(config.create_tags.get("team").map(String::as_str), Some("storage"));
        assert!(config.snapshot_name.is_none());
        assert_eq!(config.mkfs_inode_ratio, 16384);
        assert_eq!(config.timeouts.device_node, Duration::from_secs(30));
        assert_eq!(config.timeouts.volume_available, Duration::from_secs(600));
    }

    #[test]
    fn test_bad_tag_rejected() {
        let result = Args::try_parse_from([
            "fleet-volume-provisioner",
            "--tag-key", "env",
            "--tag-value", "prod",
            "--attach-as", "xvdb",
            "--mount-point", "/data",
            "--create-size", "20",
            "--create-name", "prod-data",
            "--create-volume-type", "gp2",
            "--create-tags", "no-separator",
        ]);
        assert!(result.is_err());
    }
}
