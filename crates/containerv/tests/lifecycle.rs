//! Lifecycle behavior that runs without privileges, plus root-only
//! end-to-end checks (run with `--ignored` on a Linux box as root).

use containerv::{LayerContext, LayerSpec};
use std::path::PathBuf;

fn fixture_rootfs(dir: &tempfile::TempDir) -> PathBuf {
    let base = dir.path().join("base");
    std::fs::create_dir_all(base.join("usr/bin")).unwrap();
    std::fs::create_dir_all(base.join("etc")).unwrap();
    std::fs::write(base.join("etc/hostname"), b"fixture\n").unwrap();
    base
}

#[test]
fn compose_then_destroy_leaves_no_work_dir() {
    let dir = tempfile::tempdir().unwrap();
    let base = fixture_rootfs(&dir);
    let work = dir.path().join("work");

    let layers = [
        LayerSpec::BaseRootfs { path: base },
        LayerSpec::Overlay { upper: None },
    ];
    let mut ctx = LayerContext::compose(&layers, "t-cleanup", &work).unwrap();
    let root = ctx.rootfs_path().to_path_buf();
    assert!(root.starts_with(&work));

    ctx.destroy().unwrap();
    assert!(!work.join("t-cleanup").exists());
}

#[test]
fn destroy_is_idempotent_on_the_context() {
    let dir = tempfile::tempdir().unwrap();
    let base = fixture_rootfs(&dir);
    let layers = [
        LayerSpec::BaseRootfs { path: base },
        LayerSpec::Overlay { upper: None },
    ];
    let mut ctx = LayerContext::compose(&layers, "t-idem", &dir.path().join("w")).unwrap();
    ctx.destroy().unwrap();
    // Nothing left to unwind; a second pass must not fail.
    ctx.destroy().unwrap();
}

#[test]
fn supplied_upper_dir_is_not_owned() {
    let dir = tempfile::tempdir().unwrap();
    let base = fixture_rootfs(&dir);
    let upper = dir.path().join("my-upper");
    std::fs::create_dir_all(&upper).unwrap();

    let layers = [
        LayerSpec::BaseRootfs { path: base },
        LayerSpec::Overlay {
            upper: Some(upper.clone()),
        },
    ];
    let mut ctx = LayerContext::compose(&layers, "t-upper", &dir.path().join("w")).unwrap();
    ctx.destroy().unwrap();
    // A caller-supplied upper dir survives the container.
    assert!(upper.exists());
}

// ---------------------------------------------------------------------
// Root-only end-to-end checks
// ---------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod privileged {
    use super::*;
    use containerv::{Container, ContainerOptions, ContainerState, SpawnOptions};
    use std::time::Duration;

    fn options(dir: &tempfile::TempDir) -> ContainerOptions {
        ContainerOptions {
            work_root: dir.path().join("work"),
            ready_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[test]
    #[ignore = "requires root and a Linux kernel"]
    fn create_spawn_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let base = fixture_rootfs(&dir);
        std::fs::copy("/usr/bin/true", base.join("usr/bin/true")).unwrap();

        let layers = [
            LayerSpec::BaseRootfs { path: base },
            LayerSpec::Overlay { upper: None },
        ];
        let container = Container::create(&layers, options(&dir)).unwrap();
        assert_eq!(container.state(), ContainerState::Running);
        assert_ne!(container.cgroup_id(), 0);

        let result = container
            .spawn(
                "/usr/bin/true",
                &[],
                &SpawnOptions {
                    wait: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(result.exit_status, Some(0));

        container.destroy().unwrap();
        assert_eq!(container.state(), ContainerState::Destroyed);

        // Idempotent destroy.
        container.destroy().unwrap();
    }

    #[test]
    #[ignore = "requires root and a Linux kernel"]
    fn kill_of_missing_pid_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let base = fixture_rootfs(&dir);
        let layers = [
            LayerSpec::BaseRootfs { path: base },
            LayerSpec::Overlay { upper: None },
        ];
        let container = Container::create(&layers, options(&dir)).unwrap();
        container.kill(999_999).unwrap();
        container.destroy().unwrap();
    }

    #[test]
    #[ignore = "requires root and a Linux kernel"]
    fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let base = fixture_rootfs(&dir);
        let layers = [
            LayerSpec::BaseRootfs { path: base },
            LayerSpec::Overlay { upper: None },
        ];
        let container = Container::create(&layers, options(&dir)).unwrap();

        let src = dir.path().join("payload");
        std::fs::write(&src, b"recipe contents").unwrap();
        container
            .upload(&[src.clone()], &["/tmp/payload".into()])
            .unwrap();

        let back = dir.path().join("payload-back");
        container
            .download(&["/tmp/payload".into()], &[back.clone()])
            .unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"recipe contents");

        container.destroy().unwrap();
    }
}
