// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

#[cfg(target_os = "linux")]
mod linux_tests {
    use std::path::PathBuf;
    use std::process::Command;

    fn mount_binary() -> Option<PathBuf> {
        // this file lives in crates/projfs-fuse-host
        let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let workspace_root = crate_dir.parent()?.parent()?.to_path_buf();
        let bin_path = workspace_root.join("target").join("debug").join("projfs-mount");
        if bin_path.exists() {
            Some(bin_path)
        } else {
            eprintln!(
                "Skipping projfs-mount test: binary not found at {}",
                bin_path.display()
            );
            None
        }
    }

    #[test]
    fn mount_binary_help_runs() {
        let Some(bin_path) = mount_binary() else {
            return;
        };

        // --help must not attempt a mount
        let output = Command::new(&bin_path)
            .arg("--help")
            .output()
            .expect("able to execute projfs-mount");

        assert!(output.status.success(), "--help should succeed");
        let help = String::from_utf8_lossy(&output.stdout);
        assert!(help.contains("--retval"));
        assert!(help.contains("--pool-threads"));
        assert!(help.contains("--request-threads"));
    }

    #[test]
    fn mount_binary_rejects_unknown_retval() {
        let Some(bin_path) = mount_binary() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let output = Command::new(&bin_path)
            .args(["--retval", "sometimes"])
            .arg(dir.path())
            .arg(dir.path())
            .output()
            .expect("able to execute projfs-mount");
        assert!(!output.status.success());
        // the error lists the accepted symbols
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("expected one of: allow, deny, null"));
    }
}
