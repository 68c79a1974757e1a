// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Allow/deny scenarios driven through the mount controller against a
//! real lower directory

use crossbeam_channel::Sender;
use mockall::mock;
use projfs_core::{
    Convention, DenyReason, DispatchMode, Event, EventHandler, HandlerContext, HandlerRegistry,
    OperationId, OperationKind, ProjfsConfig, ProviderResult,
};
use projfs_fuse_host::{
    fixed_result_registry, registry_for, ControllerError, MountError, MountHandle, RequestPool,
};
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

mock! {
    Handler {}
    impl EventHandler for Handler {
        fn handle(&self, event: &Event, context: &HandlerContext) -> i32;
    }
}

struct Fixture {
    _dir: TempDir,
    lower: std::path::PathBuf,
    handle: MountHandle,
}

fn mount_with(registry: HandlerRegistry, config: ProjfsConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let lower = dir.path().join("lower");
    let mount = dir.path().join("mount");
    fs::create_dir(&lower).unwrap();
    fs::create_dir(&mount).unwrap();
    let handle = MountHandle::detached(&lower, &mount, Arc::new(registry), &config).unwrap();
    let lower = fs::canonicalize(&lower).unwrap();
    Fixture {
        _dir: dir,
        lower,
        handle,
    }
}

fn mount_fixed(retval: &str) -> Fixture {
    let registry = fixed_result_registry(retval, Convention::Posix).unwrap();
    mount_with(registry, ProjfsConfig::default())
}

fn pid() -> u32 {
    std::process::id()
}

/// Defers every permission on `slow` and reports its id; allows the rest
fn deferring_registry(ids: Sender<OperationId>) -> HandlerRegistry {
    let handler = move |event: &Event, _: &HandlerContext| {
        if event.path == Path::new("slow") {
            let _ = ids.send(event.id);
            ProviderResult::Pending.code()
        } else {
            ProviderResult::Success.code()
        }
    };
    registry_for(Arc::new(handler))
}

fn pooled_provider_config() -> ProjfsConfig {
    ProjfsConfig {
        convention: Convention::ProviderApi,
        dispatch: DispatchMode::Pooled { threads: 2 },
        ..ProjfsConfig::default()
    }
}

#[test]
fn allow_lets_mkdir_through_and_logs_it() {
    let fx = mount_fixed("allow");
    let controller = fx.handle.controller();
    controller.mkdir(Path::new("target"), 0o755, pid()).unwrap();
    assert!(fx.lower.join("target").is_dir());
    assert_eq!(
        controller.dispatcher().log().lines(),
        vec!["create_dir path=target decision=allow"]
    );
}

#[test]
fn denied_unlink_keeps_the_file() {
    let fx = mount_fixed("deny");
    fs::create_dir(fx.lower.join("target")).unwrap();
    fs::write(fx.lower.join("target/f1.txt"), b"keep").unwrap();

    let err = fx
        .handle
        .controller()
        .unlink(Path::new("target/f1.txt"), pid())
        .unwrap_err();
    assert!(matches!(err, ControllerError::Denied(DenyReason::PermissionDenied)));
    assert_eq!(err.errno(), libc::EPERM);
    assert_eq!(fs::read(fx.lower.join("target/f1.txt")).unwrap(), b"keep");
    assert_eq!(
        fx.handle.controller().dispatcher().log().lines(),
        vec!["delete_file path=target/f1.txt decision=deny(permission_denied)"]
    );
}

#[test]
fn denied_rmdir_keeps_the_directory() {
    let fx = mount_fixed("eacces");
    fs::create_dir(fx.lower.join("d")).unwrap();
    let err = fx.handle.controller().rmdir(Path::new("d"), pid()).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
    assert!(fx.lower.join("d").is_dir());
}

#[test]
fn null_result_is_treated_as_invalid() {
    let fx = mount_fixed("null");
    fs::write(fx.lower.join("f"), b"").unwrap();
    let err = fx.handle.controller().unlink(Path::new("f"), pid()).unwrap_err();
    assert!(matches!(err, ControllerError::Denied(DenyReason::InvalidArgument)));
    assert!(fx.lower.join("f").exists());
}

#[test]
fn notification_results_never_block_creation() {
    let fx = mount_fixed("deny");
    let controller = fx.handle.controller();
    controller.mkdir(Path::new("made"), 0o755, pid()).unwrap();
    let fh = controller
        .create(Path::new("made/new.txt"), 0o644, libc::O_WRONLY, pid())
        .unwrap();
    controller.release(fh).unwrap();
    assert!(fx.lower.join("made/new.txt").is_file());
}

#[test]
fn allowed_rename_moves_and_logs_the_target() {
    let fx = mount_fixed("allow");
    fs::write(fx.lower.join("a.txt"), b"x").unwrap();
    let controller = fx.handle.controller();
    controller.rename(Path::new("a.txt"), Path::new("b.txt"), pid()).unwrap();
    assert!(!fx.lower.join("a.txt").exists());
    assert!(fx.lower.join("b.txt").exists());
    assert_eq!(
        controller.dispatcher().log().lines(),
        vec!["rename path=a.txt target=b.txt decision=allow"]
    );
}

#[test]
fn denied_rename_leaves_both_names_alone() {
    let fx = mount_fixed("deny");
    fs::write(fx.lower.join("a.txt"), b"x").unwrap();
    let err = fx
        .handle
        .controller()
        .rename(Path::new("a.txt"), Path::new("b.txt"), pid())
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
    assert!(fx.lower.join("a.txt").exists());
    assert!(!fx.lower.join("b.txt").exists());
}

#[test]
fn hard_link_is_a_notification_with_target() {
    let fx = mount_fixed("deny");
    fs::write(fx.lower.join("orig"), b"x").unwrap();
    let controller = fx.handle.controller();
    controller.link(Path::new("orig"), Path::new("alias"), pid()).unwrap();
    assert!(fx.lower.join("alias").exists());
    assert_eq!(
        controller.dispatcher().log().lines(),
        vec!["link path=orig target=alias decision=allow"]
    );
}

#[test]
fn projection_xattrs_are_reserved() {
    let fx = mount_fixed("allow");
    fs::write(fx.lower.join("f"), b"").unwrap();
    let controller = fx.handle.controller();
    let err = controller
        .setxattr(Path::new("f"), OsStr::new("user.projection.empty"), b"", 0)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
    let err = controller
        .removexattr(Path::new("f"), OsStr::new("user.projection.empty"))
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[test]
fn close_reports_modification_and_owner() {
    let mut handler = MockHandler::new();
    let me = pid();
    handler
        .expect_handle()
        .withf(move |event, _| event.kind == OperationKind::CloseModify && event.pid == me)
        .times(1)
        .return_const(0);
    handler
        .expect_handle()
        .withf(|event, _| event.kind == OperationKind::CloseNoModify)
        .times(1)
        .return_const(0);
    handler
        .expect_handle()
        .withf(|event, _| {
            !matches!(event.kind, OperationKind::CloseModify | OperationKind::CloseNoModify)
        })
        .return_const(0);

    let fx = mount_with(registry_for(Arc::new(handler)), ProjfsConfig::default());
    fs::write(fx.lower.join("data"), b"").unwrap();
    let controller = fx.handle.controller();

    let writer = controller.open(Path::new("data"), libc::O_WRONLY, me).unwrap();
    controller.write(writer, 0, b"hello").unwrap();
    controller.flush(writer, me).unwrap();
    controller.release(writer).unwrap();

    let reader = controller.open(Path::new("data"), libc::O_RDONLY, me).unwrap();
    assert_eq!(controller.read(reader, 0, 16).unwrap(), b"hello");
    controller.release(reader).unwrap();
    assert_eq!(controller.open_handles(), 0);

    let lines = controller.dispatcher().log().lines();
    assert!(lines.contains(&"close_modify path=data decision=allow".to_string()));
    assert!(lines.contains(&"close_no_modify path=data decision=allow".to_string()));
}

#[test]
fn provider_helpers_reject_escaping_paths() {
    let fx = mount_fixed("allow");
    let controller = fx.handle.controller();
    let err = controller
        .create_proj_dir(Path::new("../outside"), 0o755)
        .unwrap_err();
    assert!(matches!(err, ControllerError::UnsafePath(_)));
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(controller
        .create_proj_file(Path::new("/abs"), 4, 0o644)
        .is_err());

    controller.create_proj_dir(Path::new("proj"), 0o700).unwrap();
    controller.create_proj_file(Path::new("proj/file"), 4, 0o000).unwrap();
    controller
        .create_proj_symlink(Path::new("proj/link"), Path::new("file"))
        .unwrap();
    assert_eq!(fs::metadata(fx.lower.join("proj/file")).unwrap().len(), 4);
    assert_eq!(
        fs::read_link(fx.lower.join("proj/link")).unwrap(),
        Path::new("file")
    );
    // provider helpers bypass dispatch entirely
    assert!(controller.dispatcher().log().is_empty());
}

#[test]
fn escaping_operation_paths_fail_with_eacces() {
    let fx = mount_fixed("allow");
    let err = fx
        .handle
        .controller()
        .unlink(Path::new("../../etc/passwd"), pid())
        .unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
}

#[test]
fn pooled_mount_denies_and_drains_on_stop() {
    let registry = fixed_result_registry("eperm", Convention::Posix).unwrap();
    let config = ProjfsConfig {
        dispatch: DispatchMode::Pooled { threads: 2 },
        ..ProjfsConfig::default()
    };
    let fx = mount_with(registry, config);
    fs::write(fx.lower.join("f"), b"").unwrap();
    let controller = Arc::clone(fx.handle.controller());

    assert_eq!(
        controller.unlink(Path::new("f"), pid()).unwrap_err().errno(),
        libc::EPERM
    );
    controller.mkdir(Path::new("d"), 0o755, pid()).unwrap();

    let state = fx.handle.stop();
    assert_eq!(state.abandoned, 0);
    assert_eq!(state.events_logged, 2);
    let pool = state.pool.unwrap();
    assert_eq!(pool.executed, 2);
    assert!(fx.lower.join("f").exists());
}

#[test]
fn event_log_file_receives_lines() {
    let log_dir = tempfile::tempdir().unwrap();
    let log_path = log_dir.path().join("events.log");
    let config = ProjfsConfig {
        event_log: Some(log_path.clone()),
        ..ProjfsConfig::default()
    };
    let fx = mount_with(fixed_result_registry("allow", Convention::Posix).unwrap(), config);
    fx.handle.controller().mkdir(Path::new("x"), 0o755, pid()).unwrap();
    drop(fx);
    let content = fs::read_to_string(&log_path).unwrap();
    assert_eq!(content.lines().collect::<Vec<_>>(), vec!["create_dir path=x decision=allow"]);
}

#[test]
fn invalid_mount_paths_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let lower = dir.path().join("lower");
    fs::create_dir(&lower).unwrap();
    let registry = Arc::new(HandlerRegistry::new());
    let err = MountHandle::detached(
        &lower,
        &dir.path().join("missing"),
        registry,
        &ProjfsConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MountError::InvalidMountPath { .. }));
}

#[test]
fn deferred_permission_does_not_hold_up_other_paths() {
    let (id_tx, id_rx) = crossbeam_channel::unbounded();
    let fx = mount_with(deferring_registry(id_tx), pooled_provider_config());
    fs::write(fx.lower.join("slow"), b"").unwrap();
    fs::write(fx.lower.join("fast"), b"").unwrap();
    let controller = Arc::clone(fx.handle.controller());

    let requests = RequestPool::new(2);
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let submit = |name: &'static str| {
        let controller = Arc::clone(&controller);
        let done = done_tx.clone();
        let request = Box::new(move || {
            let result = controller.unlink(Path::new(name), pid()).map_err(|err| err.errno());
            let _ = done.send((name, result));
        });
        assert!(requests.submit(request).is_ok());
    };

    submit("slow");
    let slow_id = id_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    submit("fast");
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(("fast", Ok(()))));
    assert!(!fx.lower.join("fast").exists());
    assert!(fx.lower.join("slow").exists());
    assert!(done_rx.try_recv().is_err());

    controller
        .dispatcher()
        .complete(slow_id, ProviderResult::Success.code())
        .unwrap();
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(("slow", Ok(()))));
    assert!(!fx.lower.join("slow").exists());
    assert_eq!(
        controller.dispatcher().log().lines(),
        vec![
            "delete_file path=fast decision=allow",
            "delete_file path=slow decision=allow",
        ]
    );
}

#[test]
fn stop_releases_a_parked_permission() {
    let (id_tx, id_rx) = crossbeam_channel::unbounded();
    let fx = mount_with(deferring_registry(id_tx), pooled_provider_config());
    fs::write(fx.lower.join("slow"), b"").unwrap();

    let controller = Arc::clone(fx.handle.controller());
    let waiter = thread::spawn(move || {
        controller.unlink(Path::new("slow"), pid()).map_err(|err| err.errno())
    });
    id_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    while fx.handle.controller().dispatcher().pending_count() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let state = fx.handle.stop();
    assert_eq!(state.abandoned, 1);
    assert_eq!(waiter.join().unwrap(), Err(libc::EIO));
    assert!(fx.lower.join("slow").exists());
}
