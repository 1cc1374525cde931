//! Runs the preprocessing stages for one session in their fixed order.
//!
//! Every stage checks the on-disk state first and does nothing if its work
//! is already done, so an interrupted run can simply be started again.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::AppContext;
use crate::core::checksum::{self, CHECKSUM_FILENAME};
use crate::core::hardware::{self, HardwareConfiguration};
use crate::core::log_compactor::{self, CompactionOptions, CompactionReport};
use crate::core::markers::{self, MarkerKind, PurgeReport};
use crate::core::models::{SessionIdentity, SessionTree, Tier};
use crate::core::{pull, session};
use crate::core::transcoder::{
    self, FOV_FILENAME, MOTION_ESTIMATOR_FILENAME, TranscodeOptions, TranscodeReport,
};
use crate::core::transfer_engine::{self, TransferRequest, TransferResult};
use crate::error::{Error, IoResultExt, Result};

/// Camera source ids and the names their videos are given.
const CAMERA_VIDEOS: [(&str, &str); 2] = [("051.mp4", "face_camera"), ("062.mp4", "body_camera")];

#[derive(Debug, Default)]
pub struct PreprocessReport {
    pub capture_cache_renamed: bool,
    pub logs: CompactionReport,
    pub videos_renamed: usize,
    pub pulled: Option<TransferResult>,
    pub transcoded: TranscodeReport,
    /// Empty when the session had already been pushed.
    pub pushed: Vec<TransferResult>,
}

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn preprocess(&self, tree: &SessionTree) -> Result<PreprocessReport> {
        let span = info_span!("preprocess", session = tree.session_name());
        self.run_stages(tree).instrument(span).await
    }

    /// Remove every directory whose marker says it is safe to.
    pub fn purge(&self) -> Result<PurgeReport> {
        markers::purge(&self.ctx.config.storage)
    }

    /// Remove a failed or unwanted session from every tier and clear the
    /// shared capture cache.
    ///
    /// A session the acquisition runtime never initialized goes without asking.
    /// Any other session may hold valid data, so the operator has to confirm.
    pub async fn purge_failed_session(&self, tree: &SessionTree) -> Result<PurgeReport> {
        if session::is_initialized(tree) {
            warn!(session = tree.session_name(), "Purging a session that may hold valid data");
            if !self.ctx.operator.confirm_purge(tree.session_name()).await? {
                info!(session = tree.session_name(), "Session purge aborted");
                return Ok(PurgeReport::default());
            }
        }

        let removed = session::remove_session_dirs(tree)?;
        session::reset_capture_cache(tree)?;
        info!(
            session = tree.session_name(),
            directories = removed.len(),
            "Session purged"
        );
        Ok(PurgeReport { removed })
    }

    /// Move every pushed session of `subject` from `source_project` to
    /// `target_project`.
    ///
    /// Sessions are taken from the server copy: each is pulled into the target
    /// project on the workstation, resealed and pushed again, and only then
    /// removed from the source project. Per-subject persistent data follows,
    /// and the source subject directories are removed at the end.
    pub async fn migrate_subject(
        &self,
        subject: &str,
        source_project: &str,
        target_project: &str,
    ) -> Result<MigrationReport> {
        let span = info_span!("migrate", subject, source_project, target_project);
        self.migrate_sessions(subject, source_project, target_project)
            .instrument(span)
            .await
    }

    async fn migrate_sessions(
        &self,
        subject: &str,
        source_project: &str,
        target_project: &str,
    ) -> Result<MigrationReport> {
        let roots = &self.ctx.config.storage;
        let project_dir = roots.workstation_root.join(target_project);
        if !project_dir.is_dir() {
            return Err(Error::MissingProject {
                project: target_project.to_string(),
                path: project_dir,
            });
        }

        let tree_for = |project: &str, session: &str| {
            SessionTree::new(
                SessionIdentity {
                    project: project.to_string(),
                    subject: subject.to_string(),
                    session: session.to_string(),
                },
                roots.clone(),
            )
        };

        let local = roots.workstation_root.join(source_project).join(subject);
        let unpushed: Vec<String> = session::list_sessions(&local)?
            .into_iter()
            .filter(|name| {
                !markers::is_marked(
                    &tree_for(source_project, name).raw_data(Tier::Workstation),
                    MarkerKind::Telomere,
                )
            })
            .collect();
        if !unpushed.is_empty() {
            return Err(Error::UnpushedSessions {
                subject: subject.to_string(),
                project: source_project.to_string(),
                sessions: unpushed,
            });
        }

        let remote = roots.server_root.join(source_project).join(subject);
        let mut report = MigrationReport::default();
        for name in session::list_sessions(&remote)? {
            let old = tree_for(source_project, &name);
            let new = tree_for(target_project, &name);
            self.migrate_session(&old, &new)
                .instrument(info_span!("session", session = %name))
                .await?;
            report.sessions.push(name);
        }

        let old = tree_for(source_project, "");
        let new = tree_for(target_project, "");
        for tier in [Tier::Capture, Tier::Workstation] {
            move_directory(&old.persistent_data(tier), &new.persistent_data(tier))?;
        }
        for tier in [Tier::Workstation, Tier::Archive, Tier::Server] {
            let directory = old.subject_dir(tier);
            if directory.is_dir() {
                fs::remove_dir_all(&directory).at(&directory)?;
            }
        }

        info!(sessions = report.sessions.len(), "Subject migrated");
        Ok(report)
    }

    async fn migrate_session(&self, old: &SessionTree, new: &SessionTree) -> Result<()> {
        for tier in [Tier::Workstation, Tier::Archive, Tier::Server] {
            let directory = new.session_dir(tier);
            if directory.exists() {
                return Err(Error::SessionExists { path: directory });
            }
        }

        let engine = self.ctx.transfer_engine(self.ctx.config.workers.pull);
        engine
            .transfer(&TransferRequest {
                source: old.raw_data(Tier::Server),
                destination: new.raw_data(Tier::Workstation),
            })
            .await?;

        for tier in [Tier::Workstation, Tier::Archive, Tier::Server] {
            if let Err(e) = session::lay_out(new, tier) {
                warn!(tier = tier.as_str(), error = %e, "Skipping unreachable tier");
            }
        }

        self.ctx.metadata_sync.sync(new).await?;
        self.push(new).await?;
        session::remove_session_dirs(old)?;
        Ok(())
    }

    async fn run_stages(&self, tree: &SessionTree) -> Result<PreprocessReport> {
        info!(path = %tree.path().display(), "Preprocessing session");

        if !session::is_initialized(tree) {
            return Err(Error::UninitializedSession {
                session: tree.session_name().to_string(),
            });
        }

        let hardware = HardwareConfiguration::load(&tree.hardware_configuration_path())?;
        let expects_frames = hardware::expects_mesoscope_frames(hardware.as_ref());
        if !expects_frames {
            info!("Session ran without the mesoscope, skipping frame stages");
        }

        let mut report = PreprocessReport::default();

        if expects_frames {
            report.capture_cache_renamed = rename_capture_cache(tree)?;
        }

        report.logs = self.compact_logs(tree).await?;
        report.videos_renamed = rename_videos(tree)?;

        if expects_frames {
            report.pulled = self.pull_frames(tree).await?;
            report.transcoded = self.transcode_frames(tree).await?;
        }

        self.ctx.metadata_sync.sync(tree).await?;

        report.pushed = self.push(tree).await?;

        info!(
            logs = report.logs.archives.len(),
            stacks = report.transcoded.stacks.len(),
            pushed = report.pushed.len(),
            "Preprocessing complete"
        );
        Ok(report)
    }

    async fn compact_logs(&self, tree: &SessionTree) -> Result<CompactionReport> {
        let options = CompactionOptions {
            workers: self.ctx.config.workers.compaction,
            verify_integrity: self.ctx.config.compaction.verify_integrity,
            remove_sources: true,
        };
        log_compactor::compact(&tree.behavior_log(Tier::Workstation), options).await
    }

    /// Copy the session cache from the capture PC into `raw_mesoscope_frames`
    /// and tag the cache for removal.
    async fn pull_frames(&self, tree: &SessionTree) -> Result<Option<TransferResult>> {
        let source = tree.session_dir(Tier::Capture);
        if !source.is_dir() {
            debug!(source = %source.display(), "No session cache on the capture PC");
            return Ok(None);
        }
        if markers::is_marked(&source, MarkerKind::Ubiquitin) {
            debug!(source = %source.display(), "Capture data already pulled");
            return Ok(None);
        }

        pull::await_required_files(
            tree.session_name(),
            &source,
            self.ctx.operator.as_ref(),
            self.ctx.config.pull.max_attempts,
        )
        .await?;

        remove_runtime_markers(&source)?;
        checksum::checksum_and_save(&source, self.ctx.config.workers.checksum).await?;

        let destination = tree.pulled_frames();
        let engine = self.ctx.transfer_engine(self.ctx.config.workers.pull);
        let result = engine
            .transfer(&TransferRequest {
                source: source.clone(),
                destination: destination.clone(),
            })
            .await?;

        // The session is sealed as a whole before the push.
        let sidecar = destination.join(CHECKSUM_FILENAME);
        if let Err(e) = fs::remove_file(&sidecar)
            && e.kind() != ErrorKind::NotFound
        {
            return Err(Error::io(sidecar, e));
        }

        markers::mark(&source, MarkerKind::Ubiquitin)?;
        info!(files = result.files, bytes = result.total_bytes, "Capture data pulled");
        Ok(Some(result))
    }

    async fn transcode_frames(&self, tree: &SessionTree) -> Result<TranscodeReport> {
        let config = &self.ctx.config;
        let options = TranscodeOptions {
            workers: config.workers.transcode,
            batch_size: config.transcoder.batch_size,
            verify_integrity: config.transcoder.verify_integrity,
            remove_sources: config.transcoder.remove_sources,
        };

        let output = tree.mesoscope_frames(Tier::Workstation);
        let report =
            transcoder::transcode_directory(&tree.pulled_frames(), &output, options).await?;

        persist_references(&output, &tree.persistent_data(Tier::Capture));
        Ok(report)
    }

    /// Seal `raw_data`, copy it to the archive and the server, then tag the
    /// workstation copy once both verified.
    async fn push(&self, tree: &SessionTree) -> Result<Vec<TransferResult>> {
        let raw_data = tree.raw_data(Tier::Workstation);
        if markers::is_marked(&raw_data, MarkerKind::Telomere) {
            debug!(raw_data = %raw_data.display(), "Session already pushed");
            return Ok(Vec::new());
        }

        let mut destinations = Vec::with_capacity(2);
        for tier in [Tier::Archive, Tier::Server] {
            let root = tree.roots.root(tier);
            if !root.is_dir() {
                return Err(Error::io(root, std::io::Error::from(ErrorKind::NotFound)));
            }
            destinations.push(tree.raw_data(tier));
        }

        checksum::checksum_and_save(&raw_data, self.ctx.config.workers.checksum).await?;

        let engine = self.ctx.transfer_engine(self.ctx.config.workers.transfer);
        let results = transfer_engine::copy_to_all(
            engine,
            raw_data.clone(),
            destinations,
            self.ctx.config.transfer.destination_policy,
        )
        .await?;

        markers::mark(&raw_data, MarkerKind::Telomere)?;
        info!(destinations = results.len(), "Session pushed to long-term storage");
        Ok(results)
    }
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Sessions moved, in the order they were processed.
    pub sessions: Vec<String>,
}

/// Run preprocessing for `tree` with the collaborators in `ctx`.
pub async fn preprocess(ctx: &AppContext, tree: &SessionTree) -> Result<PreprocessReport> {
    Orchestrator::new(ctx.clone()).preprocess(tree).await
}

/// Give the shared capture cache a session-specific name and leave a fresh
/// empty cache behind for the next session.
pub fn rename_capture_cache(tree: &SessionTree) -> Result<bool> {
    let cache = tree.capture_cache();
    let target = tree.session_dir(Tier::Capture);

    if target.exists() {
        debug!(target = %target.display(), "Capture cache already renamed");
        return Ok(false);
    }
    if !cache.is_dir() || fs::read_dir(&cache).at(&cache)?.next().is_none() {
        debug!(cache = %cache.display(), "Capture cache absent or empty");
        return Ok(false);
    }

    fs::rename(&cache, &target).at(&target)?;
    fs::create_dir_all(&cache).at(&cache)?;
    info!(target = %target.display(), "Capture cache renamed");
    Ok(true)
}

/// Replace camera source ids with readable names.
pub fn rename_videos(tree: &SessionTree) -> Result<usize> {
    let directory = tree.camera_frames(Tier::Workstation);
    let mut renamed = 0;
    for (source, label) in CAMERA_VIDEOS {
        let from = directory.join(source);
        if from.is_file() {
            let to = directory.join(format!("{}_{label}.mp4", tree.session_name()));
            fs::rename(&from, &to).at(&to)?;
            renamed += 1;
        }
    }
    Ok(renamed)
}

/// Replace `target` with `source`. A missing `source` leaves `target` alone.
fn move_directory(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Ok(());
    }
    if target.exists() {
        fs::remove_dir_all(target).at(target)?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    fs::rename(source, target).at(target)
}

/// Delete the capture software's runtime `*.bin` markers from `directory`.
fn remove_runtime_markers(directory: &Path) -> Result<()> {
    let stale: Vec<PathBuf> = fs::read_dir(directory)
        .at(directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "bin"))
        .collect();

    for path in stale {
        fs::remove_file(&path).at(&path)?;
    }
    Ok(())
}

/// Keep the subject's first motion reference and field of view on the capture
/// PC so later sessions can reuse them. Failures only warn: the session data
/// itself is already safe.
fn persist_references(output: &Path, persistent: &Path) {
    for name in [MOTION_ESTIMATOR_FILENAME, FOV_FILENAME] {
        let source = output.join(name);
        let target = persistent.join(name);
        if !source.is_file() || target.exists() {
            continue;
        }
        if let Err(e) = fs::create_dir_all(persistent).and_then(|_| fs::copy(&source, &target)) {
            warn!(target = %target.display(), error = %e, "Failed to persist reference file");
        }
    }
}
