//! Tests that perform real mounts.
//!
//! Each test runs on its own thread inside a private mount namespace, so
//! nothing is left behind on the host. They are skipped unless running as
//! root.
#![cfg(feature = "integration")]

use std::error::Error;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, symlink};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use mortise::exec::{ExecReport, Outcome};
use mortise::idmap::{IdRange, IdentityMapping, IdmapSupport, probe_idmapped_mounts};
use mortise::mountinfo::{LiveMountRecord, MountTable, ProcMountInfo};
use mortise::namespace::NamespacePolicy;
use mortise::options::Propagation;
use mortise::plan::{MountKind, MountRequest};
use mortise::{MountSetup, setup_mounts};
use mortise_common::{HostPaths, MortiseError};
use rustix::mount::MountFlags;
use rustix::thread::UnshareFlags;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error + Send + Sync>>;

/// The calling thread's view, which differs from the process view after
/// a per-thread unshare.
const THREAD_MOUNTINFO: &str = "/proc/thread-self/mountinfo";

/// Run `test` in a fresh mount namespace with `<tmp>/rootfs` and
/// `<tmp>/src` created for it.
fn isolated<F>(test: F) -> TestResult
where
    F: FnOnce(&Path, &Path) -> TestResult + Send + 'static,
{
    if !rustix::process::geteuid().is_root() {
        eprintln!("skipping: needs root");
        return Ok(());
    }

    let dir = TempDir::new()?;
    let base = fs::canonicalize(dir.path())?;
    let rootfs = base.join("rootfs");
    let src = base.join("src");
    fs::create_dir(&rootfs)?;
    fs::create_dir(&src)?;

    std::thread::spawn(move || {
        mortise::namespace::unshare(UnshareFlags::NEWNS)?;
        mortise::sys::set_propagation(Path::new("/"), Propagation::Rslave)?;
        test(&rootfs, &src)
    })
    .join()
    .map_err(|_| "test thread panicked")?
}

fn setup(rootfs: &Path) -> MountSetup {
    MountSetup::new(rootfs).with_host_paths(HostPaths::new().with_mountinfo(THREAD_MOUNTINFO))
}

fn run(setup: &MountSetup) -> Result<ExecReport, MortiseError> {
    setup_mounts(setup)
}

fn mount_at(path: &Path) -> Result<LiveMountRecord, Box<dyn Error + Send + Sync>> {
    ProcMountInfo::new(THREAD_MOUNTINFO)
        .records()?
        .into_iter()
        .rev()
        .find(|r| r.target == path)
        .ok_or_else(|| format!("nothing mounted at {}", path.display()).into())
}

/// Mount a tmpfs with exactly `flags` at `path`, so tests do not depend on
/// how the host mounted its temporary directory.
fn mount_tmpfs(path: &Path, flags: MountFlags) -> TestResult {
    mortise::sys::mount_fs(Path::new("tmpfs"), path, "tmpfs", flags, "")?;
    Ok(())
}

const LOCKED: MountFlags = MountFlags::NOSUID
    .union(MountFlags::NODEV)
    .union(MountFlags::NOEXEC);

fn tmpfs(destination: &str, options: &[&str]) -> MountRequest {
    MountRequest::new(destination, MountKind::Tmpfs)
        .with_source("tmpfs")
        .with_options(options.iter().copied())
}

fn bind(destination: &str, source: &Path, options: &[&str]) -> MountRequest {
    MountRequest::new(destination, MountKind::Bind)
        .with_source(source.display().to_string())
        .with_options(options.iter().copied())
}

#[test_log::test]
fn readonly_tmpfs_variants() -> TestResult {
    isolated(|rootfs, _| {
        run(&setup(rootfs).with_mounts(vec![
            tmpfs("/rw", &[]),
            tmpfs("/ro", &["ro"]),
            tmpfs("/rro", &["rro"]),
        ]))?;

        assert!(!mount_at(&rootfs.join("rw"))?.is_readonly());
        assert!(mount_at(&rootfs.join("ro"))?.is_readonly());
        let rro = mount_at(&rootfs.join("rro"))?;
        assert!(rro.is_readonly());
        assert_eq!(rro.fs_type, "tmpfs");
        Ok(())
    })
}

#[test_log::test]
fn readonly_binds_of_files_and_directories() -> TestResult {
    isolated(|rootfs, src| {
        fs::create_dir(src.join("dir"))?;
        fs::write(src.join("file"), "content")?;

        run(&setup(rootfs).with_mounts(vec![
            bind("/dir", &src.join("dir"), &["bind", "ro"]),
            bind("/file", &src.join("file"), &["bind", "rro"]),
        ]))?;

        assert!(mount_at(&rootfs.join("dir"))?.is_readonly());
        assert!(mount_at(&rootfs.join("file"))?.is_readonly());
        assert_eq!(fs::read_to_string(rootfs.join("file"))?, "content");
        assert!(fs::write(rootfs.join("file"), "changed").is_err());
        assert!(fs::write(src.join("file"), "changed").is_ok());
        Ok(())
    })
}

#[test_log::test]
fn rro_reaches_submounts() -> TestResult {
    isolated(|rootfs, src| {
        let sub = src.join("sub");
        fs::create_dir(&sub)?;
        mount_tmpfs(&sub, MountFlags::empty())?;

        run(&setup(rootfs).with_mounts(vec![
            bind("/plain", src, &["rbind", "ro"]),
            bind("/deep", src, &["rbind", "rro"]),
        ]))?;

        assert!(mount_at(&rootfs.join("plain"))?.is_readonly());
        assert!(!mount_at(&rootfs.join("plain/sub"))?.is_readonly());
        assert!(mount_at(&rootfs.join("deep"))?.is_readonly());
        assert!(mount_at(&rootfs.join("deep/sub"))?.is_readonly());
        Ok(())
    })
}

#[test_log::test]
fn flag_axes_are_applied() -> TestResult {
    isolated(|rootfs, src| {
        run(&setup(rootfs).with_mounts(vec![
            tmpfs("/locked", &["nosuid", "nodev", "noexec"]),
            tmpfs("/open", &["suid", "dev", "exec"]),
            tmpfs("/sync", &["sync"]),
            tmpfs("/dirsync", &["dirsync"]),
            bind("/bound", src, &["bind", "nosuid", "noexec"]),
        ]))?;

        let locked = mount_at(&rootfs.join("locked"))?;
        for flag in ["nosuid", "nodev", "noexec"] {
            assert!(locked.has_vfs_option(flag), "missing {flag}");
        }
        let open = mount_at(&rootfs.join("open"))?;
        for flag in ["nosuid", "nodev", "noexec"] {
            assert!(!open.has_vfs_option(flag), "unexpected {flag}");
        }
        assert!(mount_at(&rootfs.join("sync"))?.fs_options.contains("sync"));
        assert!(mount_at(&rootfs.join("dirsync"))?.fs_options.contains("dirsync"));

        let bound = mount_at(&rootfs.join("bound"))?;
        assert!(bound.has_vfs_option("nosuid"));
        assert!(bound.has_vfs_option("noexec"));
        Ok(())
    })
}

#[test_log::test]
fn readonly_path_keeps_parent_restrictions() -> TestResult {
    isolated(|rootfs, src| {
        fs::create_dir(src.join("world"))?;

        let report = run(&setup(rootfs)
            .with_mounts(vec![bind(
                "/test",
                src,
                &["bind", "nosuid", "nodev", "noexec"],
            )])
            .with_readonly_paths(["/test/world".to_string(), "/test/missing".to_string()]))?;

        let world = mount_at(&rootfs.join("test/world"))?;
        for flag in ["ro", "nosuid", "nodev", "noexec"] {
            assert!(world.has_vfs_option(flag), "missing {flag}");
        }
        assert_eq!(report.count(&Outcome::Readonly), 1);
        assert_eq!(report.count(&Outcome::Skipped), 1);
        Ok(())
    })
}

#[test_log::test]
fn doubled_separator_destination() -> TestResult {
    isolated(|rootfs, _| {
        run(&setup(rootfs).with_mounts(vec![tmpfs("/test//test", &[])]))?;
        assert_eq!(mount_at(&rootfs.join("test/test"))?.fs_type, "tmpfs");
        Ok(())
    })
}

#[test_log::test]
fn symlink_sources_become_symlinks() -> TestResult {
    isolated(|rootfs, src| {
        symlink("/does/not/exist", src.join("dangling"))?;
        fs::write(src.join("target"), "")?;
        symlink("target", src.join("link"))?;

        let report = run(&setup(rootfs).with_mounts(vec![
            bind("/etc/dangling", &src.join("dangling"), &["bind"]),
            bind("/etc/copied", &src.join("link"), &["bind", "copy-symlink"]),
        ]))?;

        assert_eq!(
            fs::read_link(rootfs.join("etc/dangling"))?,
            PathBuf::from("/does/not/exist")
        );
        assert_eq!(fs::read_link(rootfs.join("etc/copied"))?, PathBuf::from("target"));
        assert_eq!(report.count(&Outcome::Symlinked), 2);
        Ok(())
    })
}

#[test_log::test]
fn special_files_keep_their_type() -> TestResult {
    isolated(|rootfs, src| {
        let fifo = src.join("fifo");
        rustix::fs::mkfifoat(rustix::fs::CWD, &fifo, rustix::fs::Mode::from_raw_mode(0o600))?;
        let socket = src.join("socket");
        let _listener = UnixListener::bind(&socket)?;

        let variants: [&[&str]; 3] = [&["bind"], &["bind", "ro"], &["rbind", "rro"]];
        let mut mounts = Vec::new();
        for (i, options) in variants.iter().enumerate() {
            mounts.push(bind(&format!("/fifo{i}"), &fifo, options));
            mounts.push(bind(&format!("/socket{i}"), &socket, options));
        }
        run(&setup(rootfs).with_mounts(mounts))?;

        for i in 0..variants.len() {
            let fifo = fs::symlink_metadata(rootfs.join(format!("fifo{i}")))?;
            assert!(fifo.file_type().is_fifo(), "fifo{i}");
            let socket = fs::symlink_metadata(rootfs.join(format!("socket{i}")))?;
            assert!(socket.file_type().is_socket(), "socket{i}");
        }
        assert!(mount_at(&rootfs.join("fifo1"))?.is_readonly());
        assert!(mount_at(&rootfs.join("socket2"))?.is_readonly());
        Ok(())
    })
}

#[test_log::test]
fn idmapped_bind_shifts_ownership() -> TestResult {
    isolated(|rootfs, src| {
        if probe_idmapped_mounts(src) != IdmapSupport::Supported {
            eprintln!("skipping: id-mapped mounts unsupported on {}", src.display());
            return Ok(());
        }
        fs::write(src.join("file"), "")?;

        let mapped = |destination: &str, host_id: u32| -> Result<MountRequest, MortiseError> {
            let mapping = IdentityMapping::new(vec![IdRange::new(0, host_id, 10)])?;
            let mut request = bind(destination, src, &["bind", "ro", "idmap"]);
            request.uid_mappings = Some(mapping.clone());
            request.gid_mappings = Some(mapping);
            Ok(request)
        };

        let report = run(&setup(rootfs).with_mounts(vec![mapped("/one", 1)?, mapped("/two", 2)?]))?;
        assert_eq!(report.count(&Outcome::IdMapped), 2);

        let one = fs::metadata(rootfs.join("one/file"))?;
        assert_eq!((one.uid(), one.gid()), (1, 1));
        let two = fs::metadata(rootfs.join("two/file"))?;
        assert_eq!((two.uid(), two.gid()), (2, 2));
        assert_eq!(fs::metadata(src.join("file"))?.uid(), 0);
        assert!(mount_at(&rootfs.join("one"))?.is_readonly());
        Ok(())
    })
}

#[test_log::test]
fn cgroup_is_always_readonly() -> TestResult {
    isolated(|rootfs, _| {
        if !Path::new("/sys/fs/cgroup").is_dir() {
            eprintln!("skipping: no host cgroup hierarchy");
            return Ok(());
        }
        let cgroup = MountRequest::new("/sys/fs/cgroup", MountKind::Cgroup)
            .with_source("cgroup")
            .with_options(["nosuid", "noexec", "nodev"]);
        run(&setup(rootfs).with_mounts(vec![cgroup]))?;

        let record = mount_at(&rootfs.join("sys/fs/cgroup"))?;
        assert!(record.is_readonly());
        assert!(record.has_vfs_option("nosuid"));
        Ok(())
    })
}

#[test_log::test]
fn masked_paths_are_emptied() -> TestResult {
    isolated(|rootfs, _| {
        mount_tmpfs(rootfs, MountFlags::empty())?;
        fs::create_dir(rootfs.join("secret"))?;
        fs::write(rootfs.join("secret/key"), "hunter2")?;
        fs::write(rootfs.join("token"), "abc")?;

        let report = run(&setup(rootfs).with_masked_paths([
            "/secret".to_string(),
            "/token".to_string(),
            "/missing".to_string(),
        ]))?;

        assert_eq!(fs::read_dir(rootfs.join("secret"))?.count(), 0);
        assert!(mount_at(&rootfs.join("secret"))?.is_readonly());
        assert_eq!(fs::read_to_string(rootfs.join("token"))?, "");
        assert!(fs::metadata(rootfs.join("token"))?.file_type().is_char_device());
        assert_eq!(report.count(&Outcome::Masked), 2);
        assert_eq!(report.count(&Outcome::Skipped), 1);
        Ok(())
    })
}

#[test_log::test]
fn absolute_symlinks_stay_inside_rootfs() -> TestResult {
    isolated(|rootfs, _| {
        fs::create_dir(rootfs.join("real"))?;
        symlink("/real", rootfs.join("escape"))?;
        symlink("../../..", rootfs.join("real/up"))?;

        run(&setup(rootfs).with_mounts(vec![tmpfs("/escape/x", &[])]))?;
        assert_eq!(mount_at(&rootfs.join("real/x"))?.fs_type, "tmpfs");

        let err = run(&setup(rootfs).with_mounts(vec![tmpfs("/real/up/y", &[])]))
            .expect_err("climbing out of the rootfs must fail");
        assert!(matches!(err, MortiseError::PathEscape { .. }));
        Ok(())
    })
}

#[test_log::test]
fn masked_child_keeps_parent_restrictions() -> TestResult {
    isolated(|rootfs, src| {
        mount_tmpfs(src, MountFlags::empty())?;
        fs::create_dir(src.join("acpi"))?;
        fs::write(src.join("kcore"), "core")?;

        run(&setup(rootfs)
            .with_mounts(vec![bind("/p", src, &["bind", "nosuid", "nodev", "noexec"])])
            .with_masked_paths(["/p/acpi".to_string(), "/p/kcore".to_string()]))?;

        for masked in ["p/acpi", "p/kcore"] {
            let record = mount_at(&rootfs.join(masked))?;
            for flag in ["ro", "nosuid", "nodev", "noexec"] {
                assert!(record.has_vfs_option(flag), "{masked} missing {flag}");
            }
        }
        assert_eq!(fs::read_dir(rootfs.join("p/acpi"))?.count(), 0);
        // Under a nodev parent the /dev/null stand-in cannot even be opened.
        assert!(fs::read_to_string(rootfs.join("p/kcore")).is_err());
        Ok(())
    })
}

#[test_log::test]
fn bind_remount_keeps_source_restrictions() -> TestResult {
    isolated(|rootfs, src| {
        mount_tmpfs(src, LOCKED)?;

        run(&setup(rootfs).with_mounts(vec![
            bind("/b", src, &["bind", "ro"]),
            bind("/relaxed", src, &["bind", "ro", "exec", "suid"]),
        ]))?;

        let b = mount_at(&rootfs.join("b"))?;
        for flag in ["ro", "nosuid", "nodev", "noexec"] {
            assert!(b.has_vfs_option(flag), "bind remount dropped {flag}");
        }
        let relaxed = mount_at(&rootfs.join("relaxed"))?;
        assert!(relaxed.is_readonly());
        assert!(relaxed.has_vfs_option("nodev"));
        assert!(!relaxed.has_vfs_option("noexec"));
        assert!(!relaxed.has_vfs_option("nosuid"));
        Ok(())
    })
}

#[test_log::test]
fn rw_after_rro_is_writable() -> TestResult {
    isolated(|rootfs, src| {
        mount_tmpfs(src, MountFlags::RDONLY)?;

        run(&setup(rootfs).with_mounts(vec![
            tmpfs("/t", &["rro", "rw"]),
            bind("/b", src, &["rro", "rw"]),
        ]))?;

        assert!(!mount_at(&rootfs.join("t"))?.is_readonly());
        assert!(!mount_at(&rootfs.join("b"))?.is_readonly());
        fs::write(rootfs.join("t/file"), "x")?;
        Ok(())
    })
}

#[test_log::test]
fn strictatime_replaces_relatime() -> TestResult {
    isolated(|rootfs, src| {
        mount_tmpfs(src, MountFlags::RELATIME)?;

        run(&setup(rootfs).with_mounts(vec![
            tmpfs("/fresh", &["strictatime"]),
            bind("/bound", src, &["bind", "strictatime"]),
        ]))?;

        for dest in ["fresh", "bound"] {
            let record = mount_at(&rootfs.join(dest))?;
            assert!(!record.has_vfs_option("relatime"), "{dest} kept relatime");
            assert!(!record.has_vfs_option("noatime"), "{dest} has noatime");
        }
        Ok(())
    })
}

#[test_log::test]
fn readonly_proc_bus_keeps_proc_restrictions() -> TestResult {
    isolated(|rootfs, _| {
        let proc = MountRequest::new("/proc", MountKind::Proc)
            .with_source("proc")
            .with_options(["nosuid", "noexec", "nodev"]);
        let result =
            run(&setup(rootfs).with_mounts(vec![proc]).with_readonly_paths(["/proc/bus".to_string()]));
        let report = match result {
            Err(e) if e.errno() == Some(libc::EPERM) => {
                eprintln!("skipping: procfs cannot be mounted here");
                return Ok(());
            }
            other => other?,
        };

        if report.count(&Outcome::Readonly) == 1 {
            let bus = mount_at(&rootfs.join("proc/bus"))?;
            for flag in ["ro", "nosuid", "nodev", "noexec"] {
                assert!(bus.has_vfs_option(flag), "/proc/bus missing {flag}");
            }
        }
        assert!(!mount_at(&rootfs.join("proc"))?.is_readonly());
        Ok(())
    })
}

#[test_log::test]
fn cgroup_readonly_for_every_namespace_combination() -> TestResult {
    if !Path::new("/sys/fs/cgroup").is_dir() {
        eprintln!("skipping: no host cgroup hierarchy");
        return Ok(());
    }
    for cgroupns in [false, true] {
        for net in [false, true] {
            for explicit in [false, true] {
                isolated(move |rootfs, _| {
                    let policy = NamespacePolicy {
                        mount: true,
                        cgroup: cgroupns,
                        net,
                        ..Default::default()
                    };
                    let mut mounts = vec![
                        MountRequest::new("/sys", MountKind::Sysfs)
                            .with_source("sysfs")
                            .with_options(["nosuid", "noexec", "nodev"]),
                    ];
                    if explicit {
                        mounts.push(
                            MountRequest::new("/sys/fs/cgroup", MountKind::Cgroup)
                                .with_source("cgroup")
                                .with_options(["nosuid", "noexec", "nodev", "relatime"]),
                        );
                    }
                    run(&setup(rootfs).with_mounts(mounts).with_namespaces(policy))?;

                    let cgroup = rootfs.join("sys/fs/cgroup");
                    let records = ProcMountInfo::new(THREAD_MOUNTINFO).records()?;
                    let under: Vec<_> =
                        records.iter().filter(|r| r.target.starts_with(&cgroup)).collect();
                    if explicit {
                        assert!(!under.is_empty(), "cgroupns={cgroupns} net={net}: nothing mounted");
                    }
                    for record in under {
                        assert!(
                            record.is_readonly(),
                            "cgroupns={cgroupns} net={net} explicit={explicit}: {} is writable",
                            record.target.display()
                        );
                    }
                    Ok(())
                })?;
            }
        }
    }
    Ok(())
}

#[test_log::test]
fn user_namespace_policy_keeps_restrictions() -> TestResult {
    isolated(|rootfs, src| {
        mount_tmpfs(src, LOCKED)?;
        fs::create_dir(src.join("hidden"))?;

        let policy = NamespacePolicy {
            user: true,
            mount: true,
            ..Default::default()
        };
        run(&setup(rootfs)
            .with_namespaces(policy)
            .with_mounts(vec![bind("/data", src, &["rbind", "ro", "rprivate"])])
            .with_masked_paths(["/data/hidden".to_string()]))?;

        for dest in ["data", "data/hidden"] {
            let record = mount_at(&rootfs.join(dest))?;
            for flag in ["ro", "nosuid", "nodev", "noexec"] {
                assert!(record.has_vfs_option(flag), "{dest} missing {flag}");
            }
        }
        Ok(())
    })
}

#[test_log::test]
fn ridmap_reaches_submounts() -> TestResult {
    isolated(|rootfs, src| {
        let sub = src.join("sub");
        fs::create_dir(&sub)?;
        mount_tmpfs(&sub, MountFlags::empty())?;
        if probe_idmapped_mounts(src) != IdmapSupport::Supported
            || probe_idmapped_mounts(&sub) != IdmapSupport::Supported
        {
            eprintln!("skipping: id-mapped mounts unsupported here");
            return Ok(());
        }
        fs::write(src.join("top"), "")?;
        fs::write(sub.join("nested"), "")?;

        let mapping = IdentityMapping::new(vec![IdRange::new(0, 5, 10)])?;
        let mut recursive = bind("/r", src, &["rbind", "ridmap"]);
        recursive.uid_mappings = Some(mapping.clone());
        recursive.gid_mappings = Some(mapping);

        let report = run(&setup(rootfs).with_mounts(vec![recursive]))?;
        assert_eq!(report.count(&Outcome::IdMapped), 1);

        assert_eq!(fs::metadata(rootfs.join("r/top"))?.uid(), 5);
        let nested = fs::metadata(rootfs.join("r/sub/nested"))?;
        assert_eq!((nested.uid(), nested.gid()), (5, 5));
        Ok(())
    })
}

#[test_log::test]
fn readonly_rootfs_leaves_submounts_alone() -> TestResult {
    isolated(|rootfs, _| {
        mount_tmpfs(rootfs, LOCKED)?;

        let report = run(&setup(rootfs)
            .with_readonly_rootfs(true)
            .with_mounts(vec![tmpfs("/tmp", &["nosuid"])]))?;

        let root = mount_at(rootfs)?;
        for flag in ["ro", "nosuid", "nodev", "noexec"] {
            assert!(root.has_vfs_option(flag), "rootfs missing {flag}");
        }
        assert!(!mount_at(&rootfs.join("tmp"))?.is_readonly());
        assert!(fs::write(rootfs.join("file"), "x").is_err());
        assert_eq!(report.entries.last().map(|e| &e.outcome), Some(&Outcome::Readonly));
        Ok(())
    })
}
