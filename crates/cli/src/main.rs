use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use storage_planner_core::matcher::SizePreference;
use storage_planner_core::platform::platform_report;
use storage_planner_core::units::human_size;
use storage_planner_core::{
    apply_guided, disk_for_match, guided_targets, model_from_probe_data, render, DiskMatch,
    GuidedCapability, GuidedChoice, GuidedStorageTarget, PlatformInfo, ProbeData, Secret,
    SizingPolicy, StorageModel, StoragePlan, Target,
};
use storage_planner_service::{load_config, FileProber, ServiceConfig, StorageService};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "storage-planner",
    version,
    about = "Plan installer storage layouts from probed block devices."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List guided install targets for a probe-data file.
    Targets(TargetsArgs),
    /// Apply a guided target and write the rendered storage plan.
    Apply(ApplyArgs),
    /// Render the untouched model of a probe-data file.
    Render(RenderArgs),
    /// Run one probe cycle through the storage service and print its status.
    Probe(ProbeArgs),
    /// Pick a disk by serial/model/vendor/path globs.
    Match(MatchArgs),
    /// Show the detected platform and bootloader.
    Doctor,
}

#[derive(Debug, Args)]
struct ModelArgs {
    /// Probe data JSON (blockdev/filesystem/os/mount).
    #[arg(long, value_name = "FILE")]
    probe_data: PathBuf,

    /// Service configuration JSON; defaults apply when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TargetsArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Print the targets as JSON instead of a list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliSizingPolicy {
    Scaled,
    All,
}

impl From<CliSizingPolicy> for SizingPolicy {
    fn from(value: CliSizingPolicy) -> Self {
        match value {
            CliSizingPolicy::Scaled => SizingPolicy::Scaled,
            CliSizingPolicy::All => SizingPolicy::All,
        }
    }
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Index of the target as listed by `targets`.
    #[arg(long)]
    target: usize,

    /// Capability such as DIRECT, LVM, LVM_LUKS, ZFS.
    #[arg(long, default_value = "DIRECT")]
    capability: String,

    /// Passphrase for encrypted capabilities.
    #[arg(long)]
    password: Option<String>,

    /// Logical volume sizing for LVM layouts.
    #[arg(long)]
    sizing_policy: Option<CliSizingPolicy>,

    /// Output plan path.
    #[arg(long, default_value = "storage-plan.json", value_name = "FILE")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Output plan path; printed to stdout when omitted.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ProbeArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Write crash reports of failed probe kinds here.
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MatchArgs {
    /// Probe data JSON.
    #[arg(long, value_name = "FILE")]
    probe_data: PathBuf,

    #[arg(long, value_name = "GLOB")]
    serial: Option<String>,

    #[arg(long, value_name = "GLOB")]
    model: Option<String>,

    #[arg(long, value_name = "GLOB")]
    vendor: Option<String>,

    #[arg(long, value_name = "GLOB")]
    path: Option<String>,

    /// Only solid-state (`true`) or rotational (`false`) disks.
    #[arg(long)]
    ssd: Option<bool>,

    /// Prefer the smallest candidate instead of the largest.
    #[arg(long)]
    smallest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Targets(args) => run_targets_command(args),
        Commands::Apply(args) => run_apply_command(args),
        Commands::Render(args) => run_render_command(args),
        Commands::Probe(args) => run_probe_command(args).await,
        Commands::Match(args) => run_match_command(args),
        Commands::Doctor => {
            run_doctor_command();
            Ok(())
        }
    }
}

fn load_service_config(path: Option<&Path>) -> Result<ServiceConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(ServiceConfig::default()),
    }
}

fn read_probe_data(path: &Path) -> Result<ProbeData> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_model(args: &ModelArgs) -> Result<(ServiceConfig, PlatformInfo, StorageModel)> {
    let config = load_service_config(args.config.as_deref())?;
    let bootloader = config.bootloader();
    let data = read_probe_data(&args.probe_data)?;
    let model = model_from_probe_data(&data, bootloader)
        .with_context(|| format!("failed to load {}", args.probe_data.display()))?;
    Ok((config, PlatformInfo::classic(bootloader), model))
}

fn describe_target(model: &StorageModel, target: &Target) -> String {
    match target {
        Target::Reformat { disk } => format!("reformat {}", model.label(*disk)),
        Target::UseGap { disk, size, .. } => {
            format!("use {} of free space on {}", human_size(*size), model.label(*disk))
        }
        Target::Resize {
            partition,
            new_size,
            minimum,
            maximum,
            ..
        } => format!(
            "resize {} to {} (min {}, max {})",
            model.label(*partition),
            human_size(*new_size),
            human_size(*minimum),
            human_size(*maximum)
        ),
        Target::EraseInstall { partition, .. } => {
            let os = model
                .partition(*partition)
                .ok()
                .and_then(|p| p.os.as_ref())
                .map(|os| os.long.clone())
                .unwrap_or_else(|| "unknown system".to_string());
            format!("replace {} ({os})", model.label(*partition))
        }
        Target::Manual => "manual partitioning".to_string(),
    }
}

fn run_targets_command(args: TargetsArgs) -> Result<()> {
    let (config, platform, model) = load_model(&args.model)?;
    let targets = guided_targets(&model, &platform, &config.planner);

    if args.json {
        let payload = serde_json::to_string_pretty(&targets).context("failed to serialize targets")?;
        println!("{payload}");
        return Ok(());
    }

    println!(
        "{} guided target(s) for {}:",
        targets.len(),
        args.model.probe_data.display()
    );
    for (index, target) in targets.iter().enumerate() {
        println!("[{index}] {}", describe_target(&model, &target.target));
        if !target.allowed.is_empty() {
            println!("    allowed: {:?}", target.allowed);
        }
        for refused in &target.disallowed {
            println!(
                "    refused {:?}: {:?}{}",
                refused.capability,
                refused.reason,
                refused
                    .message
                    .as_deref()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn parse_capability(value: &str) -> Result<GuidedCapability> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_uppercase()))
        .map_err(|_| anyhow!("unknown capability '{value}'"))
}

fn pick_target(targets: Vec<GuidedStorageTarget>, index: usize) -> Result<GuidedStorageTarget> {
    let count = targets.len();
    targets
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("target {index} out of range ({count} offered)"))
}

fn run_apply_command(args: ApplyArgs) -> Result<()> {
    let (config, platform, mut model) = load_model(&args.model)?;
    let target = pick_target(guided_targets(&model, &platform, &config.planner), args.target)?;
    let capability = parse_capability(&args.capability)?;
    if target.target != Target::Manual && !target.allowed.contains(&capability) {
        bail!(
            "{capability:?} is not available for target {} (allowed: {:?})",
            args.target,
            target.allowed
        );
    }

    let description = describe_target(&model, &target.target);
    let mut choice = GuidedChoice::new(target.target, capability);
    choice.password = args.password.map(Secret::new);
    choice.sizing_policy = args.sizing_policy.map(SizingPolicy::from);
    apply_guided(&mut model, &choice, &platform, &config.planner)?;

    let plan = render(&model)?;
    write_plan(&plan, &args.output)?;
    println!("Applied {capability:?}: {description}");
    println!(
        "Plan written to {} ({} action(s)).",
        args.output.display(),
        plan.config.len()
    );
    Ok(())
}

fn write_plan(plan: &StoragePlan, output: &Path) -> Result<()> {
    let payload = serde_json::to_string_pretty(plan).context("failed to serialize plan")?;
    fs::write(output, payload)
        .with_context(|| format!("failed to write plan to {}", output.display()))
}

fn run_render_command(args: RenderArgs) -> Result<()> {
    let (_, _, model) = load_model(&args.model)?;
    let plan = render(&model)?;
    match args.output {
        Some(output) => {
            write_plan(&plan, &output)?;
            println!("Plan written to {}", output.display());
        }
        None => {
            let payload = serde_json::to_string_pretty(&plan).context("failed to serialize plan")?;
            println!("{payload}");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ProbeSummary {
    disks: usize,
    targets: usize,
}

async fn run_probe_command(args: ProbeArgs) -> Result<()> {
    let config = load_service_config(args.model.config.as_deref())?;
    let platform = PlatformInfo::classic(config.bootloader());
    let service = StorageService::new(
        config,
        platform,
        Arc::new(FileProber::new(&args.model.probe_data)),
    );
    service.start(None)?;
    if let Err(err) = service.wait_for_probe().await {
        warn!(error = %format!("{err:#}"), "probe cycle failed");
    }

    let status = service.status()?;
    println!("Status: {:?} after {} load(s)", status.status, status.loads);
    for (scope, state) in &status.scopes {
        println!("- {} probe: {state:?}", scope.label());
    }
    if let Some(dir) = &args.report_dir {
        for report in service.controller().errors()? {
            let path = report.write(dir)?;
            println!("Crash report {:?} written to {}", report.kind, path.display());
        }
    }

    let summary = ProbeSummary {
        disks: service
            .controller()
            .model()?
            .map(|model| model.all_disks().len())
            .unwrap_or(0),
        targets: service.guided_targets(None)?.targets.len(),
    };
    println!(
        "{}",
        serde_json::to_string(&summary).context("failed to serialize summary")?
    );
    service.stop()?;
    Ok(())
}

fn run_match_command(args: MatchArgs) -> Result<()> {
    let data = read_probe_data(&args.probe_data)?;
    let model = model_from_probe_data(&data, storage_planner_core::Bootloader::None)?;
    let rule = DiskMatch {
        serial: args.serial,
        model: args.model,
        vendor: args.vendor,
        path: args.path,
        ssd: args.ssd,
        size: Some(if args.smallest {
            SizePreference::Smallest
        } else {
            SizePreference::Largest
        }),
    };
    let disks = model.all_disks();
    match disk_for_match(&disks, &rule)? {
        Some(disk) => println!(
            "{} ({})",
            disk.path.as_deref().unwrap_or("unnamed disk"),
            human_size(disk.size)
        ),
        None => println!("No disk matches."),
    }
    Ok(())
}

fn run_doctor_command() {
    let report = platform_report();
    println!("Architecture: {}", report.arch);
    println!("EFI firmware: {}", report.efi_firmware);
    println!("Bootloader: {:?}", report.bootloader);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use storage_planner_core::GuidedCapability;

    use super::parse_capability;

    #[test]
    fn capabilities_parse_case_insensitively() {
        assert_eq!(parse_capability("lvm_luks").expect("known"), GuidedCapability::LvmLuks);
        assert_eq!(parse_capability("DIRECT").expect("known"), GuidedCapability::Direct);
        assert!(parse_capability("btrfs").is_err());
    }
}
