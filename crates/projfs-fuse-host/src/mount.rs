// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount start/stop

use projfs_core::{
    Dispatcher, DrainedState, EventLog, HandlerRegistry, MountContext, PathMapper,
    ProjfsConfig,
};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::controller::{mark_projection_root, MountController};
use crate::error::MountError;

/// A running mount. Dropping it without `stop` still drains the pool.
pub struct MountHandle {
    controller: Arc<MountController>,
    mount_root: PathBuf,
    #[cfg(all(feature = "fuse", target_os = "linux"))]
    session: Option<fuser::BackgroundSession>,
}

impl MountHandle {
    /// Everything except the kernel transport: paths are validated, the
    /// registry sealed and the dispatcher started. The controller can be
    /// driven directly.
    pub fn detached(
        lower: &Path,
        mount: &Path,
        registry: Arc<HandlerRegistry>,
        config: &ProjfsConfig,
    ) -> Result<Self, MountError> {
        config.validate()?;
        let (lower_root, mount_root) = validate_paths(lower, mount)?;

        let log = match &config.event_log {
            Some(path) => EventLog::with_file(path).map_err(MountError::EventLog)?,
            None => EventLog::new(),
        };
        if config.initial {
            mark_projection_root(&lower_root);
        }

        let context = MountContext::new(
            PathMapper::new(&lower_root, &mount_root),
            config.convention,
            config.dispatch,
        );
        let dispatcher = Dispatcher::new(context, registry, Arc::new(log))?;
        info!(
            lower = %lower_root.display(),
            mount = %mount_root.display(),
            convention = %config.convention,
            pooled = config.dispatch.is_pooled(),
            "projfs mount prepared"
        );

        Ok(Self {
            controller: Arc::new(MountController::new(Arc::new(dispatcher))),
            mount_root,
            #[cfg(all(feature = "fuse", target_os = "linux"))]
            session: None,
        })
    }

    /// Prepare the mount and attach it to the kernel through FUSE
    #[cfg(all(feature = "fuse", target_os = "linux"))]
    pub fn start(
        lower: &Path,
        mount: &Path,
        registry: Arc<HandlerRegistry>,
        config: &ProjfsConfig,
    ) -> Result<Self, MountError> {
        let mut handle = Self::detached(lower, mount, registry, config)?;

        let mut options = vec![
            fuser::MountOption::FSName("projfs".to_string()),
            fuser::MountOption::Subtype("projfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if config.mount.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        if config.mount.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        let filesystem = crate::adapter::ProjfsFuse::new(
            Arc::clone(&handle.controller),
            config.mount.request_threads,
        );
        let session = fuser::spawn_mount2(filesystem, &handle.mount_root, &options)?;
        handle.session = Some(session);
        info!(mount = %handle.mount_root.display(), "projfs mounted");
        Ok(handle)
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    pub fn start(
        _lower: &Path,
        _mount: &Path,
        _registry: Arc<HandlerRegistry>,
        _config: &ProjfsConfig,
    ) -> Result<Self, MountError> {
        Err(MountError::Unsupported(
            "built without the `fuse` feature; rebuild with --features fuse".to_string(),
        ))
    }

    pub fn controller(&self) -> &Arc<MountController> {
        &self.controller
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn is_attached(&self) -> bool {
        #[cfg(all(feature = "fuse", target_os = "linux"))]
        {
            self.session.is_some()
        }
        #[cfg(not(all(feature = "fuse", target_os = "linux")))]
        {
            false
        }
    }

    /// Drain the dispatcher, then unmount. Draining first releases
    /// requests parked on a pending decision, which the session needs
    /// before it can end. No handler runs after this returns.
    pub fn stop(mut self) -> DrainedState {
        let state = self.controller.dispatcher().shutdown();
        self.detach();
        let open = self.controller.open_handles();
        if open > 0 {
            warn!(open, "file handles still open at unmount");
        }
        info!(
            abandoned = state.abandoned,
            events = state.events_logged,
            "projfs mount stopped"
        );
        state
    }

    fn detach(&mut self) {
        #[cfg(all(feature = "fuse", target_os = "linux"))]
        if let Some(session) = self.session.take() {
            session.join();
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        let dispatcher = self.controller.dispatcher();
        if !dispatcher.is_stopped() {
            dispatcher.shutdown();
        }
        self.detach();
    }
}

/// Check the path pair before anything is mounted; returns both paths
/// canonicalized.
pub fn validate_paths(lower: &Path, mount: &Path) -> Result<(PathBuf, PathBuf), MountError> {
    let lower_root = existing_dir(lower).map_err(|reason| MountError::InvalidLowerPath {
        path: lower.to_path_buf(),
        reason,
    })?;
    let mount_root = existing_dir(mount).map_err(|reason| MountError::InvalidMountPath {
        path: mount.to_path_buf(),
        reason,
    })?;

    if lower_root.starts_with(&mount_root) || mount_root.starts_with(&lower_root) {
        return Err(MountError::SamePath(mount_root));
    }

    if let Some(parent) = mount_root.parent() {
        let own = fs::metadata(&mount_root)?;
        let above = fs::metadata(parent)?;
        if own.dev() != above.dev() {
            return Err(MountError::MountPointBusy(mount_root));
        }
    }

    Ok((lower_root, mount_root))
}

fn existing_dir(path: &Path) -> Result<PathBuf, String> {
    let canonical = fs::canonicalize(path).map_err(|err| err.to_string())?;
    if !canonical.is_dir() {
        return Err("not a directory".to_string());
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_and_overlapping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower");
        let mount = dir.path().join("mount");
        fs::create_dir(&lower).unwrap();

        assert!(matches!(
            validate_paths(&lower, &mount),
            Err(MountError::InvalidMountPath { .. })
        ));
        assert!(matches!(
            validate_paths(&mount, &lower),
            Err(MountError::InvalidLowerPath { .. })
        ));
        assert!(matches!(validate_paths(&lower, &lower), Err(MountError::SamePath(_))));

        let nested = lower.join("inner");
        fs::create_dir(&nested).unwrap();
        assert!(matches!(validate_paths(&lower, &nested), Err(MountError::SamePath(_))));

        fs::create_dir(&mount).unwrap();
        let (l, m) = validate_paths(&lower, &mount).unwrap();
        assert!(l.is_absolute() && m.is_absolute());
    }

    #[test]
    fn files_are_not_mountable() {
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower");
        let file = dir.path().join("file");
        fs::create_dir(&lower).unwrap();
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            validate_paths(&lower, &file),
            Err(MountError::InvalidMountPath { .. })
        ));
    }
}
