use crate::cancel::CancelToken;
use crate::clone::{
    capture, check_relocated_image, verify_trailing, write_back, CapturedImages, CloneOptions,
    Progress, Region, Stage,
};
use crate::copier::BlockCopier;
use crate::error::{Error, Result};
use crate::geometry::{resolve, DeviceInfo, DiskGeometry};
use crate::gpt::{self, RegionLayout, REFERENCE_SOURCE_SECTORS};
use crate::system::{check_not_mounted, resolve_device_path, DeviceLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Capturing,
    Captured,
    Relocating,
    Relocated,
    WritingBack,
    Complete,
    Cancelled {
        during: Stage,
        target_touched: bool,
    },
    Failed {
        during: Stage,
        reason: String,
        target_touched: bool,
    },
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Complete | RunPhase::Cancelled { .. } | RunPhase::Failed { .. }
        )
    }

    /// A new run may start from here
    pub fn accepts_start(&self) -> bool {
        *self == RunPhase::Idle || self.is_terminal()
    }

    /// The run ended after writes to the target began
    ///
    /// The target then holds a partial copy; nothing is rolled back.
    pub fn target_indeterminate(&self) -> bool {
        match self {
            RunPhase::Cancelled { target_touched, .. } | RunPhase::Failed { target_touched, .. } => {
                *target_touched
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Capturing => write!(f, "capturing"),
            RunPhase::Captured => write!(f, "captured"),
            RunPhase::Relocating => write!(f, "relocating"),
            RunPhase::Relocated => write!(f, "relocated"),
            RunPhase::WritingBack => write!(f, "writing back"),
            RunPhase::Complete => write!(f, "complete"),
            RunPhase::Cancelled { during, .. } => write!(f, "cancelled during {}", during),
            RunPhase::Failed { during, reason, .. } => {
                write!(f, "failed during {}: {}", during, reason)
            }
        }
    }
}

/// Latest progress seen for the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub stage: Option<Stage>,
    pub region: Option<Region>,
    pub sectors_done: u64,
    pub sectors_total: u64,
    pub events: u64,
}

impl ProgressCounters {
    fn record(&mut self, progress: &Progress) {
        self.stage = Some(progress.stage);
        self.region = Some(progress.region);
        self.sectors_done = progress.sectors_done;
        self.sectors_total = progress.sectors_total;
        self.events += 1;
    }
}

/// Everything one run owns
#[derive(Debug)]
pub struct RunState {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub source_geometry: Option<DiskGeometry>,
    pub target_geometry: Option<DiskGeometry>,
    pub images: Option<CapturedImages>,
    pub relocated: Option<PathBuf>,
    pub progress: ProgressCounters,
    locks: Vec<DeviceLock>,
}

impl RunState {
    fn new(source: PathBuf, source_lock: DeviceLock) -> Self {
        Self {
            source,
            target: None,
            source_geometry: None,
            target_geometry: None,
            images: None,
            relocated: None,
            progress: ProgressCounters::default(),
            locks: vec![source_lock],
        }
    }
}

enum StageOutput {
    Captured {
        geometry: DiskGeometry,
        images: CapturedImages,
    },
    WrittenBack,
}

struct WorkerExit {
    result: Result<StageOutput>,
    target_touched: bool,
}

struct Worker {
    stage: Stage,
    handle: JoinHandle<WorkerExit>,
    events: Receiver<Progress>,
}

struct CaptureJob {
    source: PathBuf,
    regions: RegionLayout,
    work_dir: PathBuf,
}

struct WriteBackJob {
    target: PathBuf,
    leading: PathBuf,
    relocated: PathBuf,
    regions: RegionLayout,
    target_total_sectors: u64,
    verify: bool,
}

/// Drives one clone run at a time
///
/// ```text
/// Idle -> Capturing -> Captured -> Relocating -> Relocated -> WritingBack -> Complete
///            \             \            \             \             \
///             +-------------+------------+-------------+-------------+--> Cancelled / Failed
/// ```
///
/// Capture and write-back each run on a worker thread; relocation runs
/// synchronously on the caller's thread. Workers are observed with `poll`
/// or `wait`.
pub struct Orchestrator {
    copier: Arc<dyn BlockCopier>,
    info: Arc<dyn DeviceInfo>,
    options: CloneOptions,
    cancel: CancelToken,
    phase: RunPhase,
    run: Option<RunState>,
    worker: Option<Worker>,
}

impl Orchestrator {
    pub fn new(
        copier: Arc<dyn BlockCopier>,
        info: Arc<dyn DeviceInfo>,
        options: CloneOptions,
    ) -> Result<Self> {
        options.gpt.check_consistency(&options.regions)?;
        Ok(Self {
            copier,
            info,
            options,
            cancel: CancelToken::new(),
            phase: RunPhase::Idle,
            run: None,
            worker: None,
        })
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    /// State of the current (or last) run
    pub fn run(&self) -> Option<&RunState> {
        self.run.as_ref()
    }

    pub fn options(&self) -> &CloneOptions {
        &self.options
    }

    /// Token shared with workers; cancelling it from any thread stops the
    /// active stage at its next progress event
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Begin a run by capturing `source` on a worker thread
    pub fn start(&mut self, source: impl AsRef<Path>) -> Result<()> {
        if self.worker.is_some() || !self.phase.accepts_start() {
            return Err(Error::RunInProgress(self.phase.to_string()));
        }

        let source = source.as_ref().to_path_buf();
        let lock = DeviceLock::acquire(&source)?;
        fs::create_dir_all(&self.options.work_dir)?;

        self.cancel.reset();
        let job = CaptureJob {
            source: source.clone(),
            regions: self.options.regions,
            work_dir: self.options.work_dir.clone(),
        };
        let copier = Arc::clone(&self.copier);
        let info = Arc::clone(&self.info);
        let cancel = self.cancel.clone();
        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || WorkerExit {
                result: run_capture(copier.as_ref(), info.as_ref(), &job, &cancel, &tx),
                target_touched: false,
            })?;

        info!(source = %source.display(), "clone run started");
        self.run = Some(RunState::new(source, lock));
        self.worker = Some(Worker {
            stage: Stage::Capture,
            handle,
            events: rx,
        });
        self.phase = RunPhase::Capturing;
        Ok(())
    }

    /// Resolve the target geometry and relocate the captured trailing image
    ///
    /// Runs synchronously. The relocated image only replaces the previous
    /// one once relocation fully succeeded.
    pub fn start_relocate(&mut self, target: impl AsRef<Path>) -> Result<()> {
        if self.phase != RunPhase::Captured {
            return Err(self.invalid("relocate"));
        }
        let target = target.as_ref().to_path_buf();

        let captured = self.run.as_ref().and_then(|run| {
            run.images
                .as_ref()
                .map(|images| (run.source.clone(), images.trailing.clone()))
        });
        let Some((source, trailing)) = captured else {
            return Err(self.invalid("relocate"));
        };

        if resolve_device_path(&source) == resolve_device_path(&target) {
            return Err(Error::SameDevice(target.display().to_string()));
        }
        check_not_mounted(&target)?;
        let lock = DeviceLock::acquire(&target)?;
        if let Some(run) = self.run.as_mut() {
            run.locks.push(lock);
            run.target = Some(target.clone());
        }

        self.phase = RunPhase::Relocating;
        match relocate_for_target(self.info.as_ref(), &self.options, &trailing, &target) {
            Ok((geometry, relocated)) => {
                if let Some(run) = self.run.as_mut() {
                    run.target_geometry = Some(geometry);
                    run.relocated = Some(relocated);
                }
                info!(device = %target.display(), %geometry, "trailing image relocated");
                self.phase = RunPhase::Relocated;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(Stage::Relocate, reason, false);
                Err(e)
            }
        }
    }

    /// Write both images to the target on a worker thread
    ///
    /// The caller must have obtained the user's confirmation to overwrite
    /// the target before calling this.
    pub fn start_write_back(&mut self) -> Result<()> {
        if self.phase != RunPhase::Relocated {
            return Err(self.invalid("write back"));
        }
        let job = {
            let run = self.run.as_ref();
            match (
                run.and_then(|r| r.target.clone()),
                run.and_then(|r| r.target_geometry),
                run.and_then(|r| r.images.as_ref()),
                run.and_then(|r| r.relocated.clone()),
            ) {
                (Some(target), Some(geometry), Some(images), Some(relocated)) => WriteBackJob {
                    target,
                    leading: images.leading.clone(),
                    relocated,
                    regions: self.options.regions,
                    target_total_sectors: geometry.total_sectors,
                    verify: self.options.verify,
                },
                _ => return Err(self.invalid("write back")),
            }
        };
        check_relocated_image(&job.relocated, job.target_total_sectors, &self.options.gpt)?;
        check_not_mounted(&job.target)?;

        let copier = Arc::clone(&self.copier);
        let cancel = self.cancel.clone();
        let (tx, rx) = mpsc::channel();
        let target = job.target.clone();

        let handle = thread::Builder::new()
            .name("write-back".to_string())
            .spawn(move || {
                let mut target_touched = false;
                let result = run_write_back(copier.as_ref(), &job, &cancel, &tx, &mut target_touched);
                WorkerExit {
                    result,
                    target_touched,
                }
            })?;

        info!(device = %target.display(), "write-back started");
        self.worker = Some(Worker {
            stage: Stage::WriteBack,
            handle,
            events: rx,
        });
        self.phase = RunPhase::WritingBack;
        Ok(())
    }

    /// Request cancellation of the current run
    ///
    /// With a worker active this only raises the flag; the worker stops at
    /// its next progress event and `poll`/`wait` report `Cancelled`. Between
    /// stages the run is cancelled immediately.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.worker.is_some() {
            return;
        }
        let during = match self.phase {
            RunPhase::Captured => Stage::Relocate,
            RunPhase::Relocated => Stage::WriteBack,
            _ => return,
        };
        warn!(%during, "run cancelled between stages");
        self.phase = RunPhase::Cancelled {
            during,
            target_touched: false,
        };
        self.end_run(false);
    }

    /// Collect pending progress without blocking
    ///
    /// Applies the worker's final transition once it has exited.
    pub fn poll(&mut self) -> Vec<Progress> {
        let (mut events, finished) = match &self.worker {
            Some(worker) => (
                worker.events.try_iter().collect::<Vec<_>>(),
                worker.handle.is_finished(),
            ),
            None => return Vec::new(),
        };

        let finished_worker = if finished { self.worker.take() } else { None };
        if let Some(worker) = &finished_worker {
            events.extend(worker.events.try_iter());
        }
        for progress in &events {
            self.record(progress);
        }
        if let Some(worker) = finished_worker {
            self.finish(worker);
        }
        events
    }

    /// Block until the active worker exits, handing each progress event to
    /// `observer`
    ///
    /// Blocks on the progress channel only; the cancel token stays usable
    /// from other threads (and signal handlers) meanwhile.
    pub fn wait(&mut self, mut observer: impl FnMut(&Progress)) -> &RunPhase {
        if let Some(worker) = self.worker.take() {
            for progress in worker.events.iter() {
                self.record(&progress);
                observer(&progress);
            }
            self.finish(worker);
        }
        &self.phase
    }

    fn record(&mut self, progress: &Progress) {
        if let Some(run) = self.run.as_mut() {
            run.progress.record(progress);
        }
    }

    fn finish(&mut self, worker: Worker) {
        let stage = worker.stage;
        let exit = worker.handle.join().unwrap_or_else(|_| WorkerExit {
            result: Err(Error::Io(std::io::Error::other(format!(
                "{} worker panicked",
                stage
            )))),
            target_touched: stage == Stage::WriteBack,
        });

        match exit.result {
            Ok(StageOutput::Captured { geometry, images }) => {
                if let Some(run) = self.run.as_mut() {
                    run.source_geometry = Some(geometry);
                    run.images = Some(images);
                }
                info!(%geometry, "capture complete");
                self.phase = RunPhase::Captured;
            }
            Ok(StageOutput::WrittenBack) => {
                info!("clone run complete");
                self.phase = RunPhase::Complete;
                self.end_run(true);
            }
            Err(Error::Cancelled) => {
                warn!(%stage, target_touched = exit.target_touched, "run cancelled");
                self.phase = RunPhase::Cancelled {
                    during: stage,
                    target_touched: exit.target_touched,
                };
                self.end_run(false);
            }
            Err(e) => self.fail(stage, e.to_string(), exit.target_touched),
        }
    }

    fn fail(&mut self, during: Stage, reason: String, target_touched: bool) {
        error!(%during, %reason, target_touched, "run failed");
        self.phase = RunPhase::Failed {
            during,
            reason,
            target_touched,
        };
        self.end_run(false);
    }

    /// Release device locks; after success also drop the image files
    fn end_run(&mut self, completed: bool) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        for lock in run.locks.drain(..) {
            debug!(device = %lock.path().display(), "device lock released");
        }

        if completed && !self.options.keep_images {
            let images = run.images.iter().flat_map(|i| [&i.leading, &i.trailing]);
            for path in images.chain(run.relocated.iter()) {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove image: {}", e);
                }
            }
        }
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            action,
            state: self.phase.to_string(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.cancel();
            let _ = worker.handle.join();
        }
    }
}

fn run_capture(
    copier: &dyn BlockCopier,
    info: &dyn DeviceInfo,
    job: &CaptureJob,
    cancel: &CancelToken,
    events: &Sender<Progress>,
) -> Result<StageOutput> {
    let geometry = resolve(info, &job.source)?;
    cancel.check()?;

    if geometry.total_sectors != REFERENCE_SOURCE_SECTORS {
        warn!(
            source = %job.source.display(),
            sectors = geometry.total_sectors,
            expected = REFERENCE_SOURCE_SECTORS,
            "source size differs from the reference drive; check the region layout"
        );
    }

    let images = capture(
        copier,
        &job.source,
        &job.regions,
        geometry.total_sectors,
        &job.work_dir,
        cancel,
        &mut |p| {
            let _ = events.send(p);
        },
    )?;

    Ok(StageOutput::Captured { geometry, images })
}

fn run_write_back(
    copier: &dyn BlockCopier,
    job: &WriteBackJob,
    cancel: &CancelToken,
    events: &Sender<Progress>,
    target_touched: &mut bool,
) -> Result<StageOutput> {
    write_back(
        copier,
        &job.target,
        &job.leading,
        &job.relocated,
        &job.regions,
        job.target_total_sectors,
        cancel,
        &mut |p| {
            *target_touched = true;
            let _ = events.send(p);
        },
    )?;

    if job.verify {
        cancel.check()?;
        verify_trailing(
            &job.target,
            &job.relocated,
            &job.regions,
            job.target_total_sectors,
        )?;
    }

    Ok(StageOutput::WrittenBack)
}

/// Resolve the target and write the relocated trailing image
fn relocate_for_target(
    info: &dyn DeviceInfo,
    options: &CloneOptions,
    trailing_path: &Path,
    target: &Path,
) -> Result<(DiskGeometry, PathBuf)> {
    let geometry = resolve(info, target)?;
    let minimum = options.regions.minimum_sectors();
    if geometry.total_sectors < minimum {
        return Err(Error::DeviceTooSmall {
            target: geometry.total_sectors,
            minimum,
        });
    }

    let trailing = fs::read(trailing_path)?;
    if trailing.len() != options.regions.trailing_bytes() {
        return Err(Error::MalformedImage {
            needed: options.regions.trailing_bytes(),
            actual: trailing.len(),
        });
    }

    let before = gpt::verify(&trailing, None, &options.gpt)?;
    if !before.has_signature {
        warn!("captured trailing image carries no EFI PART signature");
    } else if !before.checksums_valid() {
        warn!("captured trailing image checksums do not validate with the configured layout");
    }

    let relocated = gpt::relocate(&trailing, &geometry, &options.gpt)?;
    let path = options.relocated_path();
    fs::write(&path, &relocated)?;
    debug!(path = %path.display(), "relocated image written");

    Ok((geometry, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_predicates() {
        assert!(RunPhase::Idle.accepts_start());
        assert!(!RunPhase::Captured.accepts_start());
        assert!(RunPhase::Complete.accepts_start());

        let cancelled = RunPhase::Cancelled {
            during: Stage::Capture,
            target_touched: false,
        };
        assert!(cancelled.is_terminal());
        assert!(!cancelled.target_indeterminate());

        let failed = RunPhase::Failed {
            during: Stage::WriteBack,
            reason: "short write".to_string(),
            target_touched: true,
        };
        assert!(failed.target_indeterminate());
        assert_eq!(failed.to_string(), "failed during write-back: short write");
    }

    #[test]
    fn test_progress_counters() {
        let mut counters = ProgressCounters::default();
        counters.record(&Progress {
            stage: Stage::Capture,
            region: Region::Leading,
            sectors_done: 2048,
            sectors_total: 6_899_870,
        });
        assert_eq!(counters.events, 1);
        assert_eq!(counters.region, Some(Region::Leading));
        assert_eq!(counters.sectors_done, 2048);
    }
}
