use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use gptclone::clone::{check_relocated_image, verify_trailing, write_back};
use gptclone::geometry::resolve;
use gptclone::gpt::{ENTRY_ARRAY_CRC_LENGTH, FIRST_REGION_SECTORS, TRAILING_REGION_SECTORS};
use gptclone::system::DeviceLock;
use gptclone::{
    check_root, relocate, verify, BlockDeviceInfo, CancelToken, CloneOptions, DeviceInfo,
    DeviceLister, DiskGeometry, FdiskInfo, GptLayout, HeaderRole, LsblkLister, Orchestrator,
    Progress, RegionLayout, RunPhase, SectorCopier,
};

#[derive(Parser)]
#[command(name = "gptclone")]
#[command(author, version, about = "Clone a GPT drive onto a differently sized drive", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List whole-disk block devices
    List,

    /// Display the geometry of a device or image file
    Info {
        /// Path to the device or image file
        device: PathBuf,

        /// Query with `fdisk -l` instead of the size ioctls
        #[arg(long)]
        fdisk: bool,
    },

    /// Capture the leading and trailing regions of a source into the work directory
    Capture {
        /// Source device
        source: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,

        /// Continue without root privileges
        #[arg(short, long)]
        force: bool,
    },

    /// Relocate a captured trailing image for a target of the given size
    Relocate {
        /// Captured trailing image
        image: PathBuf,

        /// Total sectors of the target device
        #[arg(long)]
        target_sectors: u64,

        /// Output file (defaults to trailing.relocated.bin in the work directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Show the header fields and checksums of a trailing image
    Inspect {
        /// Trailing image to inspect
        image: PathBuf,

        /// Also check the LBAs against a target of this many sectors
        #[arg(long)]
        target_sectors: Option<u64>,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Write the images in the work directory onto a target
    Write {
        /// Target device
        target: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Capture, relocate and write back in one run
    Clone {
        /// Source device
        source: PathBuf,

        /// Target device (will be overwritten)
        target: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Keep the image files after a successful run
        #[arg(long)]
        keep_images: bool,
    },
}

#[derive(Args)]
struct LayoutArgs {
    /// Sectors copied from the start of the source
    #[arg(long, default_value_t = FIRST_REGION_SECTORS)]
    leading_sectors: u64,

    /// Sectors captured from the end of the source
    #[arg(long, default_value_t = TRAILING_REGION_SECTORS)]
    trailing_sectors: u64,

    /// Bytes of the entry array covered by its CRC (decimal or 0x-prefixed)
    #[arg(long, value_parser = parse_len, default_value_t = ENTRY_ARRAY_CRC_LENGTH)]
    entry_crc_len: usize,

    /// Role the trailing header describes itself as
    #[arg(long, value_enum, default_value_t = RoleArg::Backup)]
    header_role: RoleArg,

    /// Directory holding the image files
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// Do not ask before overwriting the target
    #[arg(short, long)]
    yes: bool,

    /// Read the trailing region back after writing and compare
    #[arg(long)]
    verify: bool,

    /// Continue without root privileges
    #[arg(short, long)]
    force: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Backup,
    Primary,
}

impl From<RoleArg> for HeaderRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Backup => HeaderRole::Backup,
            RoleArg::Primary => HeaderRole::Primary,
        }
    }
}

impl LayoutArgs {
    fn regions(&self) -> RegionLayout {
        RegionLayout {
            leading_sectors: self.leading_sectors,
            trailing_sectors: self.trailing_sectors,
        }
    }

    fn gpt(&self) -> GptLayout {
        GptLayout::for_trailing_sectors(self.trailing_sectors)
            .with_entry_array_crc_len(self.entry_crc_len)
            .with_role(self.header_role.into())
    }

    fn options(&self) -> CloneOptions {
        CloneOptions::new(&self.work_dir)
            .regions(self.regions())
            .gpt_layout(self.gpt())
    }
}

fn parse_len(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid length '{}': {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List => {
            let devices = LsblkLister.list().context("Failed to list block devices")?;
            if devices.is_empty() {
                println!("No block devices found");
            }
            for device in devices {
                println!("{}", device);
            }
        }

        Commands::Info { device, fdisk } => {
            let info: &dyn DeviceInfo = if fdisk { &FdiskInfo } else { &BlockDeviceInfo };
            let geometry = resolve(info, &device)
                .with_context(|| format!("Failed to query {}", device.display()))?;
            let minimum = RegionLayout::default().minimum_sectors();

            println!("Device: {}", device.display());
            println!("Geometry: {}", geometry);
            println!(
                "Fits the default layout: {} (needs {} sectors)",
                if geometry.total_sectors >= minimum { "yes" } else { "no" },
                minimum
            );
        }

        Commands::Capture {
            source,
            layout,
            force,
        } => {
            require_root(force)?;
            let mut orchestrator = orchestrator(layout.options())?;
            install_sigint(&orchestrator.cancel_token())?;

            orchestrator
                .start(&source)
                .with_context(|| format!("Failed to start capture of {}", source.display()))?;
            let phase = wait_with_progress(&mut orchestrator);
            check_phase(&phase)?;

            let options = orchestrator.options();
            println!();
            println!("Capture complete:");
            println!("  Leading image: {}", options.leading_path().display());
            println!("  Trailing image: {}", options.trailing_path().display());
        }

        Commands::Relocate {
            image,
            target_sectors,
            output,
            layout,
        } => {
            let gpt = layout.gpt();
            gpt.check_consistency(&layout.regions())?;
            let trailing = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;

            let target = DiskGeometry::new(target_sectors);
            let relocated = relocate(&trailing, &target, &gpt)
                .with_context(|| format!("Failed to relocate {}", image.display()))?;

            let output = output.unwrap_or_else(|| layout.options().relocated_path());
            std::fs::write(&output, &relocated)
                .with_context(|| format!("Failed to write {}", output.display()))?;

            println!("{}", verify(&relocated, Some(&target), &gpt)?);
            println!("Relocated image written to {}", output.display());
        }

        Commands::Inspect {
            image,
            target_sectors,
            layout,
        } => {
            let data = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let target = target_sectors.map(DiskGeometry::new);
            let report = verify(&data, target.as_ref(), &layout.gpt())
                .with_context(|| format!("Failed to inspect {}", image.display()))?;

            println!("{}", report);
            if !report.is_consistent() {
                anyhow::bail!("{} does not validate", image.display());
            }
        }

        Commands::Write {
            target,
            layout,
            run,
        } => {
            require_root(run.force)?;
            let options = layout.options();
            options.gpt.check_consistency(&options.regions)?;
            let _lock = DeviceLock::acquire(&target)
                .with_context(|| format!("Failed to lock {}", target.display()))?;
            let geometry = resolve(&BlockDeviceInfo, &target)
                .with_context(|| format!("Failed to query {}", target.display()))?;
            gptclone::check_not_mounted(&target)?;
            let relocated = options.relocated_path();
            check_relocated_image(&relocated, geometry.total_sectors, &options.gpt)
                .with_context(|| format!("Refusing to write {}", relocated.display()))?;

            if !run.yes && !confirm(&target, &geometry)? {
                anyhow::bail!("Aborted, {} was not modified", target.display());
            }

            let cancel = CancelToken::new();
            install_sigint(&cancel)?;
            let mut printer = ProgressPrinter::default();
            let result = write_back(
                &SectorCopier::default(),
                &target,
                &options.leading_path(),
                &relocated,
                &options.regions,
                geometry.total_sectors,
                &cancel,
                &mut |p| printer.show(&p),
            );
            printer.done();
            result.with_context(|| {
                format!(
                    "Write-back to {} failed; its contents are now indeterminate",
                    target.display()
                )
            })?;

            if run.verify {
                verify_trailing(
                    &target,
                    &relocated,
                    &options.regions,
                    geometry.total_sectors,
                )?;
                println!("Trailing region verified");
            }
            println!("Images written to {}", target.display());
        }

        Commands::Clone {
            source,
            target,
            layout,
            run,
            keep_images,
        } => {
            require_root(run.force)?;
            let options = layout
                .options()
                .verify(run.verify)
                .keep_images(keep_images);
            let mut orchestrator = orchestrator(options)?;
            install_sigint(&orchestrator.cancel_token())?;

            orchestrator
                .start(&source)
                .with_context(|| format!("Failed to start capture of {}", source.display()))?;
            let phase = wait_with_progress(&mut orchestrator);
            check_phase(&phase)?;

            orchestrator
                .start_relocate(&target)
                .with_context(|| format!("Failed to relocate for {}", target.display()))?;
            let geometry = orchestrator
                .run()
                .and_then(|r| r.target_geometry)
                .context("Target geometry missing after relocation")?;

            if !run.yes && !confirm(&target, &geometry)? {
                orchestrator.cancel();
                anyhow::bail!("Aborted, {} was not modified", target.display());
            }

            orchestrator
                .start_write_back()
                .with_context(|| format!("Failed to start write-back to {}", target.display()))?;
            let phase = wait_with_progress(&mut orchestrator);
            check_phase(&phase)?;

            println!();
            println!("Clone complete:");
            println!("  Source: {}", source.display());
            println!("  Target: {} ({})", target.display(), geometry);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn orchestrator(options: CloneOptions) -> Result<Orchestrator> {
    Orchestrator::new(
        Arc::new(SectorCopier::default()),
        Arc::new(BlockDeviceInfo),
        options,
    )
    .context("Invalid region layout")
}

fn require_root(force: bool) -> Result<()> {
    if !check_root() {
        eprintln!("Warning: This tool requires root privileges to access block devices.");
        if !force {
            anyhow::bail!("Run as root or use --force to continue anyway");
        }
    }
    Ok(())
}

/// Cancel the run on Ctrl-C instead of terminating mid-write
fn install_sigint(cancel: &CancelToken) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("Failed to install SIGINT handler")?;
    Ok(())
}

fn confirm(target: &Path, geometry: &DiskGeometry) -> Result<bool> {
    println!(
        "All data on {} ({}) will be overwritten.",
        target.display(),
        geometry
    );
    print!("Type 'yes' to continue: ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn wait_with_progress(orchestrator: &mut Orchestrator) -> RunPhase {
    let mut printer = ProgressPrinter::default();
    let phase = orchestrator.wait(|p| printer.show(p)).clone();
    printer.done();
    phase
}

fn check_phase(phase: &RunPhase) -> Result<()> {
    match phase {
        RunPhase::Cancelled { .. } | RunPhase::Failed { .. } => {
            if phase.target_indeterminate() {
                eprintln!("Warning: the target was partially written and is now indeterminate.");
            }
            anyhow::bail!("Run {}", phase)
        }
        _ => Ok(()),
    }
}

/// Single-line progress on stderr, redrawn when the percentage changes
#[derive(Default)]
struct ProgressPrinter {
    last: Option<(String, u64)>,
}

impl ProgressPrinter {
    fn show(&mut self, progress: &Progress) {
        let label = format!("{} {}", progress.stage, progress.region);
        let percent = if progress.sectors_total == 0 {
            100
        } else {
            progress.sectors_done * 100 / progress.sectors_total
        };

        let current = Some((label.clone(), percent));
        if self.last == current {
            return;
        }
        if self.last.as_ref().is_some_and(|(l, _)| *l != label) {
            eprintln!();
        }
        eprint!(
            "\r{}: {:>3}% ({}/{} sectors)",
            label, percent, progress.sectors_done, progress.sectors_total
        );
        self.last = current;
    }

    fn done(&mut self) {
        if self.last.take().is_some() {
            eprintln!();
        }
    }
}
