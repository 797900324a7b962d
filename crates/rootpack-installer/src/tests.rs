use super::*;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rootpack_registry::{RepositoryLocation, RepositorySet, ResolveError};
use rootpack_squashfs::ImageBuilder;

use crate::orchestrate::ensure_committed;

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(first, second);
}

#[test]
fn layout_paths_follow_live_store_conventions() {
    let layout = RootLayout::new("/sysroot");
    assert_eq!(layout.roimg_dir(), PathBuf::from("/sysroot/roimg"));
    assert_eq!(layout.tmp_dir(), PathBuf::from("/sysroot/roimg/tmp"));
    assert_eq!(layout.etc_dir(), PathBuf::from("/sysroot/etc"));
    assert_eq!(layout.ctl_path(), PathBuf::from("/sysroot/ro/ctl"));
    assert_eq!(
        layout.image_path("zlib-amd64-1.2"),
        PathBuf::from("/sysroot/roimg/zlib-amd64-1.2.squashfs")
    );
    assert_eq!(
        layout.meta_path("zlib-amd64-1.2"),
        PathBuf::from("/sysroot/roimg/zlib-amd64-1.2.meta")
    );
    assert_eq!(
        layout.staging_path("zlib-amd64-1.2"),
        PathBuf::from(format!(
            "/sysroot/roimg/tmp/.zlib-amd64-1.2{}",
            std::process::id()
        ))
    );
    assert_eq!(
        layout.repos_config_path(),
        PathBuf::from("/sysroot/etc/rootpack/repos.toml")
    );
}

#[test]
fn byte_counter_clones_share_one_total() {
    let counter = ByteCounter::new();
    let clone = counter.clone();
    clone.add(10);

    let mut sink = Vec::new();
    let copied = counter
        .copy(&mut &b"hello"[..], &mut sink)
        .expect("must copy");
    assert_eq!(copied, 5);
    assert_eq!(sink, b"hello");
    assert_eq!(clone.get(), 15);
    assert_eq!(ByteCounter::new().get(), 0);
}

#[test]
fn installs_package_with_runtime_dependencies() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(
        &repo_root,
        "zlib",
        "1.2.11",
        &["glibc-amd64-2.31", "gcc-libs-amd64-9.2"],
        &plain_image("zlib"),
    );
    publish(&repo_root, "glibc", "2.31", &[], &plain_image("glibc"));
    publish(&repo_root, "gcc-libs", "9.2", &[], &plain_image("gcc-libs"));
    let repos = directory_set(&[&repo_root]);

    let report = install_packages(&layout, &repos, &["zlib".to_string()], &quiet_options())
        .expect("install must succeed");

    for name in ["zlib-amd64-1.2.11", "glibc-amd64-2.31", "gcc-libs-amd64-9.2"] {
        assert!(layout.image_path(name).exists(), "{name} image missing");
        assert!(layout.meta_path(name).exists(), "{name} metadata missing");
    }
    assert_eq!(report.installed_count(), 3);
    assert_eq!(
        report.sets[0].artifacts,
        vec!["zlib-amd64-1.2.11", "glibc-amd64-2.31", "gcc-libs-amd64-9.2"]
    );
    assert!(report.daemon.is_none());
    let leftovers: Vec<_> = fs::read_dir(layout.tmp_dir())
        .expect("tmp dir must exist")
        .collect();
    assert!(leftovers.is_empty(), "staging dirs left behind");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn second_install_of_same_artifact_touches_no_repository() {
    let layout = test_layout();
    layout.reset_tmp_dir().expect("must create live store");
    let image = plain_image("bash");
    let meta = b"version = \"5.0\"\n".to_vec();
    let (url, handle) = start_counting_http_server(
        vec![
            ("/pkg/bash-amd64-5.0.squashfs", image.clone()),
            ("/pkg/bash-amd64-5.0.meta", meta.clone()),
        ],
        2,
    );
    let repos = http_set(&url);
    let repo = repos.get(0).expect("must have repository");
    let counter = ByteCounter::new();

    let first = install_artifact(&layout, repo, "bash-amd64-5.0", false, &counter)
        .expect("first install must succeed");
    assert_eq!(first, ArtifactOutcome::Installed);
    assert_eq!(
        handle.join().expect("server must finish"),
        vec!["/pkg/bash-amd64-5.0.squashfs", "/pkg/bash-amd64-5.0.meta"]
    );

    // the server is gone; any request now would fail
    let second = install_artifact(&layout, repo, "bash-amd64-5.0", false, &counter)
        .expect("second install must succeed");
    assert_eq!(second, ArtifactOutcome::AlreadyInstalled);
    assert_eq!(counter.get(), (image.len() + meta.len()) as u64);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn claimed_staging_dir_defers_install() {
    let layout = test_layout();
    layout.reset_tmp_dir().expect("must create live store");
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "less", "551", &[], &plain_image("less"));
    let repos = directory_set(&[&repo_root]);
    fs::create_dir(layout.staging_path("less-amd64-551")).expect("must claim staging dir");

    let outcome = install_artifact(
        &layout,
        repos.get(0).expect("must have repository"),
        "less-amd64-551",
        true,
        &ByteCounter::new(),
    )
    .expect("deferral is not an error");
    assert_eq!(outcome, ArtifactOutcome::Deferred);
    assert!(!layout.image_path("less-amd64-551").exists());

    let sets = vec![rootpack_resolver::InstallSet {
        request: "less".to_string(),
        artifacts: vec!["less-amd64-551".to_string()],
        repository: 0,
    }];
    let err = ensure_committed(&layout, &sets).expect_err("uncommitted deferral must fail");
    assert!(err.to_string().contains("deferred to a concurrent installer"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn missing_artifact_is_fatal_and_names_it() {
    let layout = test_layout();
    layout.reset_tmp_dir().expect("must create live store");
    let repo_root = test_repo_root(&layout);
    fs::create_dir_all(repo_root.join("pkg")).expect("must create repository");
    let repos = directory_set(&[&repo_root]);

    let err = install_artifact(
        &layout,
        repos.get(0).expect("must have repository"),
        "ghost-amd64-1",
        false,
        &ByteCounter::new(),
    )
    .expect_err("missing artifact must fail");
    assert!(err
        .to_string()
        .contains("artifact pkg/ghost-amd64-1.squashfs not found"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn interrupted_commit_is_invisible_and_recovered() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "vim", "8.2", &[], &plain_image("vim"));
    let repos = directory_set(&[&repo_root]);

    // crash after the metadata rename, before the image rename
    layout.reset_tmp_dir().expect("must create live store");
    let staging = layout.staging_path("vim-amd64-8.2");
    fs::create_dir(&staging).expect("must create staging dir");
    fs::write(staging.join("vim-amd64-8.2.squashfs"), b"partial").expect("must write partial");
    fs::write(layout.meta_path("vim-amd64-8.2"), b"version = \"8.2\"\n")
        .expect("must write committed metadata");
    assert!(!layout
        .is_installed("vim-amd64-8.2")
        .expect("must check install state"));

    let report = install_packages(&layout, &repos, &["vim".to_string()], &quiet_options())
        .expect("rerun must succeed");
    assert_eq!(report.artifacts[0].outcome, ArtifactOutcome::Installed);
    assert_eq!(
        fs::read(layout.image_path("vim-amd64-8.2")).expect("must read image"),
        plain_image("vim")
    );
    assert_eq!(
        fs::read(layout.meta_path("vim-amd64-8.2")).expect("must read metadata"),
        fs::read(repo_root.join("pkg/vim-amd64-8.2.meta")).expect("must read published metadata")
    );
    assert!(!staging.exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn stale_staging_dir_is_cleared_before_install() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "grep", "3.4", &[], &plain_image("grep"));
    let repos = directory_set(&[&repo_root]);

    layout.reset_tmp_dir().expect("must create live store");
    let stale = layout.staging_path("grep-amd64-3.4");
    fs::create_dir_all(stale.join("nested")).expect("must create stale staging dir");
    fs::write(stale.join("nested/junk"), b"junk").expect("must write junk");

    let report = install_packages(&layout, &repos, &["grep".to_string()], &quiet_options())
        .expect("install must succeed");
    assert_eq!(report.artifacts[0].outcome, ArtifactOutcome::Installed);
    assert!(layout.image_path("grep-amd64-3.4").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn unknown_package_fails_and_commits_nothing() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    fs::create_dir_all(repo_root.join("pkg")).expect("must create repository");
    let repos = directory_set(&[&repo_root]);

    let err = install_packages(&layout, &repos, &["ghost".to_string()], &quiet_options())
        .expect_err("unknown package must fail");
    assert!(matches!(
        err.downcast_ref::<ResolveError>(),
        Some(ResolveError::NotFound { .. })
    ));
    let committed: Vec<_> = fs::read_dir(layout.roimg_dir())
        .expect("roimg must exist")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .collect();
    assert!(committed.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failing_request_does_not_stop_siblings() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "sed", "4.8", &[], &plain_image("sed"));
    fs::write(repo_root.join("pkg/broken-amd64.meta"), b"version = [").expect("must write");
    let repos = directory_set(&[&repo_root]);

    let err = install_packages(
        &layout,
        &repos,
        &["broken".to_string(), "sed".to_string()],
        &quiet_options(),
    )
    .expect_err("broken metadata must fail the run");
    assert!(format!("{err:#}").contains("broken"));
    assert!(layout.image_path("sed-amd64-4.8").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn highest_repository_version_is_installed() {
    let layout = test_layout();
    let roots: Vec<PathBuf> = (0..3)
        .map(|index| layout.root().join(format!("repo-{index}")))
        .collect();
    for (root, version) in roots.iter().zip(["1.0", "2.3", "1.9"]) {
        publish(root, "tmux", version, &[], &plain_image(&format!("tmux {version}")));
    }
    let repos = directory_set(&[&roots[0], &roots[1], &roots[2]]);

    install_packages(&layout, &repos, &["tmux".to_string()], &quiet_options())
        .expect("install must succeed");
    assert!(layout.image_path("tmux-amd64-2.3").exists());
    assert!(!layout.image_path("tmux-amd64-1.9").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn byte_total_matches_everything_written_across_packages() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    let mut expected = 0_u64;
    for (name, motd) in [("nginx", "a".repeat(5000)), ("redis", "b".repeat(300)), ("postfix", "c".repeat(9000))] {
        let image = ImageBuilder::new()
            .file(&format!("etc/{name}/{name}.conf"), &motd)
            .symlink(&format!("etc/{name}/default"), &format!("{name}.conf"))
            .file(&format!("usr/bin/{name}"), "binary")
            .build();
        let meta_len = publish(&repo_root, name, "1.0", &[], &image);
        expected += image.len() as u64 + meta_len + motd.len() as u64;
    }
    let repos = directory_set(&[&repo_root]);
    let options = InstallOptions {
        jobs: Some(4),
        ..quiet_options()
    };

    let report = install_packages(
        &layout,
        &repos,
        &["nginx".to_string(), "redis".to_string(), "postfix".to_string()],
        &options,
    )
    .expect("install must succeed");

    assert_eq!(report.bytes, expected);
    assert_eq!(
        fs::read_to_string(layout.etc_dir().join("redis/redis.conf")).expect("must read config"),
        "b".repeat(300)
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn independent_packages_download_concurrently_by_default() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    let names = ["curl", "wget", "rsync", "socat"];
    for name in names {
        publish(&repo_root, name, "1.0", &[], &plain_image(name));
    }
    // one resolution read plus an image and metadata fetch per package
    let (url, handle) = start_concurrent_http_server(
        repository_files(&repo_root),
        names.len() * 3,
        Duration::from_millis(300),
    );
    let repos = http_set(&url);
    let requests: Vec<String> = names.iter().map(|name| name.to_string()).collect();

    let report = install_packages(&layout, &repos, &requests, &quiet_options())
        .expect("install must succeed");
    let served = handle.join().expect("server must finish");

    assert_eq!(report.installed_count(), names.len());
    assert!(
        served.max_in_flight >= names.len(),
        "image downloads overlapped at most {} at a time",
        served.max_in_flight
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn jobs_option_caps_concurrent_downloads() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    let names = ["lua", "tcl", "guile"];
    for name in names {
        publish(&repo_root, name, "1.0", &[], &plain_image(name));
    }
    let (url, handle) = start_concurrent_http_server(
        repository_files(&repo_root),
        names.len() * 3,
        Duration::from_millis(50),
    );
    let repos = http_set(&url);
    let requests: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let options = InstallOptions {
        jobs: Some(1),
        ..quiet_options()
    };

    let report =
        install_packages(&layout, &repos, &requests, &options).expect("install must succeed");
    let served = handle.join().expect("server must finish");

    assert_eq!(report.installed_count(), names.len());
    assert_eq!(served.max_in_flight, 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn shared_dependency_is_fetched_once_and_deferred_by_the_other_request() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "libssl", "3.0", &[], &plain_image("libssl"));
    publish(&repo_root, "openssh", "9.0", &["libssl-amd64-3.0"], &plain_image("openssh"));
    publish(&repo_root, "git", "2.40", &["libssl-amd64-3.0"], &plain_image("git"));
    // two resolution reads plus three image and metadata pairs
    let (url, handle) = start_concurrent_http_server(
        repository_files(&repo_root),
        8,
        Duration::from_millis(400),
    );
    let repos = http_set(&url);

    let report = install_packages(
        &layout,
        &repos,
        &["openssh".to_string(), "git".to_string()],
        &quiet_options(),
    )
    .expect("install must succeed");
    let served = handle.join().expect("server must finish");

    let fetched = |path: &str| {
        served
            .paths
            .iter()
            .filter(|requested| *requested == path)
            .count()
    };
    assert_eq!(fetched("/pkg/libssl-amd64-3.0.squashfs"), 1);
    assert_eq!(fetched("/pkg/libssl-amd64-3.0.meta"), 1);

    let mut outcomes: Vec<ArtifactOutcome> = report
        .artifacts
        .iter()
        .filter(|artifact| artifact.name == "libssl-amd64-3.0")
        .map(|artifact| artifact.outcome)
        .collect();
    outcomes.sort_by_key(|outcome| *outcome == ArtifactOutcome::Deferred);
    assert_eq!(
        outcomes,
        vec![ArtifactOutcome::Installed, ArtifactOutcome::Deferred]
    );
    assert!(layout.image_path("libssl-amd64-3.0").exists());
    ensure_committed(&layout, &report.sets).expect("deferred dependency must be committed");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn concurrent_runs_sharing_options_count_their_own_bytes() {
    let first = test_layout();
    let second = test_layout();
    let first_repo = test_repo_root(&first);
    let second_repo = test_repo_root(&second);
    let big = ImageBuilder::new()
        .file("usr/lib/libbig.so", vec![7_u8; 200_000])
        .build();
    let small = plain_image("tiny");
    let first_expected = big.len() as u64 + publish(&first_repo, "big", "1", &[], &big);
    let second_expected = small.len() as u64 + publish(&second_repo, "tiny", "1", &[], &small);
    let first_repos = directory_set(&[&first_repo]);
    let second_repos = directory_set(&[&second_repo]);
    let options = quiet_options();

    let (first_report, second_report) = std::thread::scope(|scope| {
        let first_run = scope.spawn(|| {
            install_packages(&first, &first_repos, &["big".to_string()], &options)
        });
        let second_run = scope.spawn(|| {
            install_packages(&second, &second_repos, &["tiny".to_string()], &options)
        });
        (
            first_run.join().expect("first run must not panic"),
            second_run.join().expect("second run must not panic"),
        )
    });

    assert_eq!(
        first_report.expect("first run must succeed").bytes,
        first_expected
    );
    assert_eq!(
        second_report.expect("second run must succeed").bytes,
        second_expected
    );

    let _ = fs::remove_dir_all(first.root());
    let _ = fs::remove_dir_all(second.root());
}

#[test]
fn config_is_extracted_only_on_first_install() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    let old = ImageBuilder::new().file("etc/app.conf", "old\n").build();
    let new = ImageBuilder::new().file("etc/app.conf", "new\n").build();
    publish(&repo_root, "app", "1", &[], &old);
    let repos = directory_set(&[&repo_root]);

    install_packages(&layout, &repos, &["app".to_string()], &quiet_options())
        .expect("first install must succeed");
    assert_eq!(
        fs::read_to_string(layout.etc_dir().join("app.conf")).expect("must read config"),
        "old\n"
    );

    publish(&repo_root, "app", "2", &[], &new);
    assert!(!is_first_install(&layout, "app-amd64-2").expect("must check"));
    install_packages(&layout, &repos, &["app".to_string()], &quiet_options())
        .expect("upgrade must succeed");
    assert!(layout.image_path("app-amd64-2").exists());
    assert_eq!(
        fs::read_to_string(layout.etc_dir().join("app.conf")).expect("must read config"),
        "old\n"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn first_install_detection_matches_base_name_and_arch() {
    let layout = test_layout();
    layout.reset_tmp_dir().expect("must create live store");
    fs::write(layout.image_path("gcc-libs-amd64-9.2"), b"").expect("must write image");

    assert!(!is_first_install(&layout, "gcc-libs-amd64-10.1").expect("must check"));
    assert!(is_first_install(&layout, "gcc-amd64-9.2").expect("must check"));
    assert!(is_first_install(&layout, "gcc-libs-i686-9.2").expect("must check"));
    assert!(is_first_install(&layout, "not-versioned").expect("must check"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_mirrors_etc_tree() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    let image_path = layout.root().join("image.squashfs");
    fs::write(
        &image_path,
        ImageBuilder::new()
            .fragments(true)
            .file("etc/hostname", "box\n")
            .file_with_mode("etc/shadow", "root:*:\n", 0o600)
            .dir("etc/skel")
            .file("etc/ssl/certs/ca.pem", "pem")
            .symlink("etc/ssl/cert.pem", "certs/ca.pem")
            .fifo("etc/initctl")
            .file("usr/share/doc/README", "not config")
            .build(),
    )
    .expect("must write image");
    let counter = ByteCounter::new();

    let summary =
        extract_config(&image_path, &layout.etc_dir(), &counter).expect("must extract config");
    assert_eq!(
        summary,
        ExtractSummary {
            directories: 3,
            files: 3,
            symlinks: 1,
            skipped: 1,
        }
    );
    let etc = layout.etc_dir();
    assert_eq!(
        fs::read_to_string(etc.join("hostname")).expect("must read hostname"),
        "box\n"
    );
    let shadow_mode = fs::metadata(etc.join("shadow"))
        .expect("must stat shadow")
        .permissions()
        .mode();
    assert_eq!(shadow_mode & 0o777, 0o600);
    assert!(etc.join("skel").is_dir());
    assert_eq!(
        fs::read_link(etc.join("ssl/cert.pem")).expect("must read link"),
        PathBuf::from("certs/ca.pem")
    );
    assert!(!etc.join("initctl").exists());
    assert!(!layout.root().join("usr").exists());
    assert_eq!(counter.get(), ("box\n".len() + "root:*:\n".len() + "pem".len()) as u64);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_replaces_existing_files_and_links() {
    let layout = test_layout();
    let etc = layout.etc_dir();
    fs::create_dir_all(&etc).expect("must create etc");
    fs::write(etc.join("motd"), "a much longer previous message\n").expect("must write motd");
    std::os::unix::fs::symlink("/old/target", etc.join("localtime")).expect("must link");
    std::os::unix::fs::symlink("/elsewhere", etc.join("resolv.conf")).expect("must link");
    let image_path = layout.root().join("image.squashfs");
    fs::write(
        &image_path,
        ImageBuilder::new()
            .file("etc/motd", "hi\n")
            .symlink("etc/localtime", "/usr/share/zoneinfo/UTC")
            .file("etc/resolv.conf", "nameserver 10.0.0.1\n")
            .build(),
    )
    .expect("must write image");

    extract_config(&image_path, &etc, &ByteCounter::new()).expect("must extract config");
    assert_eq!(fs::read_to_string(etc.join("motd")).expect("must read"), "hi\n");
    assert_eq!(
        fs::read_link(etc.join("localtime")).expect("must read link"),
        PathBuf::from("/usr/share/zoneinfo/UTC")
    );
    let resolv = fs::symlink_metadata(etc.join("resolv.conf")).expect("must stat");
    assert!(resolv.file_type().is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_refuses_to_replace_directories() {
    let layout = test_layout();
    let etc = layout.etc_dir();
    fs::create_dir_all(etc.join("localtime")).expect("must create dir");
    let image_path = layout.root().join("image.squashfs");
    fs::write(
        &image_path,
        ImageBuilder::new()
            .symlink("etc/localtime", "/usr/share/zoneinfo/UTC")
            .build(),
    )
    .expect("must write image");

    let err = extract_config(&image_path, &etc, &ByteCounter::new())
        .expect_err("directory must not be replaced");
    assert!(format!("{err:#}").contains("refusing to replace directory"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_rejects_directories_listed_twice() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    let image_path = layout.root().join("image.squashfs");
    fs::write(
        &image_path,
        ImageBuilder::new()
            .file("etc/alpha/app.conf", "x = 1\n")
            .dir_alias("etc/beta", "etc/alpha")
            .build(),
    )
    .expect("must write image");

    let err = extract_config(&image_path, &layout.etc_dir(), &ByteCounter::new())
        .expect_err("repeated directory must fail");
    assert!(err.to_string().contains("listed more than once"));
    assert!(!layout.etc_dir().join("beta").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_without_etc_does_nothing() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    let image_path = layout.root().join("image.squashfs");
    fs::write(&image_path, plain_image("coreutils")).expect("must write image");

    let summary = extract_config(&image_path, &layout.etc_dir(), &ByteCounter::new())
        .expect("must succeed");
    assert_eq!(summary, ExtractSummary::default());
    assert!(!layout.etc_dir().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn extract_config_rejects_corrupt_images() {
    let layout = test_layout();
    fs::create_dir_all(layout.root()).expect("must create root");
    let image_path = layout.root().join("image.squashfs");
    fs::write(&image_path, b"definitely not squashfs").expect("must write image");

    let err = extract_config(&image_path, &layout.etc_dir(), &ByteCounter::new())
        .expect_err("corrupt image must fail");
    assert!(err.to_string().contains("failed to open image"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn missing_control_link_means_daemon_not_running() {
    let layout = test_layout();
    let repo_root = test_repo_root(&layout);
    publish(&repo_root, "htop", "3.0", &[], &plain_image("htop"));
    let repos = directory_set(&[&repo_root]);
    let options = InstallOptions {
        notify_daemon: true,
        ..quiet_options()
    };

    let report = install_packages(&layout, &repos, &["htop".to_string()], &options)
        .expect("install must succeed without daemon");
    assert_eq!(report.daemon, Some(DaemonNotification::NotRunning));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn daemon_receives_scan_request_over_control_socket() {
    let layout = test_layout();
    let (handle, _socket) = start_test_daemon(&layout, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}");

    let notification = notify_daemon(&layout).expect("notify must succeed");
    assert_eq!(notification, DaemonNotification::Rescanned);

    let request = handle.join().expect("daemon thread must finish");
    assert!(request.starts_with("POST /v1/packages/scan HTTP/1.1\r\n"));
    assert!(request.contains("Connection: close\r\n"));
    assert!(request.ends_with("\r\n\r\n{}"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn daemon_error_status_is_reported() {
    let layout = test_layout();
    let (handle, socket) = start_test_daemon(
        &layout,
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
    );

    let err = notify_daemon(&layout).expect_err("500 must fail");
    assert!(err.to_string().contains("500"));
    assert!(err.to_string().contains(&socket.display().to_string()));
    handle.join().expect("daemon thread must finish");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn unreachable_daemon_socket_is_an_error() {
    let layout = test_layout();
    let ro_dir = layout.root().join("ro");
    fs::create_dir_all(&ro_dir).expect("must create ro dir");
    std::os::unix::fs::symlink(ro_dir.join("gone.sock"), layout.ctl_path())
        .expect("must create ctl link");

    let err = notify_daemon(&layout).expect_err("dangling socket must fail");
    assert!(err.to_string().contains("failed to notify filesystem daemon"));

    let _ = fs::remove_dir_all(layout.root());
}

fn quiet_options() -> InstallOptions {
    InstallOptions {
        notify_daemon: false,
        ..InstallOptions::default()
    }
}

fn plain_image(label: &str) -> Vec<u8> {
    ImageBuilder::new()
        .file("usr/share/doc/label", label)
        .build()
}

/// Publishes `pkg/<name>-amd64.meta` for resolution and the versioned image
/// and metadata pair. Returns the versioned metadata size.
fn publish(repo_root: &Path, name: &str, version: &str, deps: &[&str], image: &[u8]) -> u64 {
    let pkg_dir = repo_root.join("pkg");
    fs::create_dir_all(&pkg_dir).expect("must create pkg dir");
    let deps = deps
        .iter()
        .map(|dep| format!("\"{dep}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let meta = format!("version = \"{version}\"\nruntime_deps = [{deps}]\n");
    fs::write(pkg_dir.join(format!("{name}-amd64.meta")), &meta).expect("must write meta");
    fs::write(pkg_dir.join(format!("{name}-amd64-{version}.meta")), &meta)
        .expect("must write versioned meta");
    fs::write(pkg_dir.join(format!("{name}-amd64-{version}.squashfs")), image)
        .expect("must write image");
    meta.len() as u64
}

fn directory_set(roots: &[&Path]) -> RepositorySet {
    RepositorySet::new(
        roots
            .iter()
            .map(|root| RepositoryLocation::Directory(root.to_path_buf())),
    )
    .expect("must build repository set")
}

fn http_set(url: &str) -> RepositorySet {
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .expect("must build test HTTP client");
    RepositorySet::with_client([RepositoryLocation::parse(url)], client)
}

fn start_counting_http_server(
    files: Vec<(&'static str, Vec<u8>)>,
    requests: usize,
) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind repository test server");
    let address = listener
        .local_addr()
        .expect("must read repository test server address");
    let url = format!("http://{address}");
    let files: Vec<(String, Vec<u8>)> = files
        .into_iter()
        .map(|(path, body)| (path.to_string(), body))
        .collect();
    let handle = std::thread::spawn(move || {
        let mut requested = Vec::new();
        for _ in 0..requests {
            let (mut stream, _) = listener.accept().expect("must accept test client");
            let path = read_request_path(&mut stream);
            write_file_response(&mut stream, &files, &path);
            requested.push(path);
        }
        requested
    });

    (url, handle)
}

struct ServedRequests {
    paths: Vec<String>,
    max_in_flight: usize,
}

/// Serves every file under `<repo_root>/pkg` at `/pkg/<file>`.
fn repository_files(repo_root: &Path) -> Vec<(String, Vec<u8>)> {
    fs::read_dir(repo_root.join("pkg"))
        .expect("must list repository")
        .map(|entry| {
            let entry = entry.expect("must read repository entry");
            let path = format!("/pkg/{}", entry.file_name().to_string_lossy());
            let body = fs::read(entry.path()).expect("must read repository file");
            (path, body)
        })
        .collect()
}

/// Answers `requests` connections, each on its own thread, delaying image
/// responses by `image_delay`. Records the most requests handled at once.
fn start_concurrent_http_server(
    files: Vec<(String, Vec<u8>)>,
    requests: usize,
    image_delay: Duration,
) -> (String, JoinHandle<ServedRequests>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind repository test server");
    let address = listener
        .local_addr()
        .expect("must read repository test server address");
    let url = format!("http://{address}");
    let files = Arc::new(files);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let handle = std::thread::spawn(move || {
        let mut handlers = Vec::with_capacity(requests);
        for _ in 0..requests {
            let (mut stream, _) = listener.accept().expect("must accept test client");
            let files = Arc::clone(&files);
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            handlers.push(std::thread::spawn(move || {
                let path = read_request_path(&mut stream);
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(current, Ordering::SeqCst);
                if path.ends_with(".squashfs") {
                    std::thread::sleep(image_delay);
                }
                // released before answering so a sequential client never overlaps
                in_flight.fetch_sub(1, Ordering::SeqCst);
                write_file_response(&mut stream, files.as_slice(), &path);
                path
            }));
        }
        let paths = handlers
            .into_iter()
            .map(|handler| handler.join().expect("request handler must finish"))
            .collect();
        ServedRequests {
            paths,
            max_in_flight: max_in_flight.load(Ordering::SeqCst),
        }
    });

    (url, handle)
}

fn read_request_path(stream: &mut TcpStream) -> String {
    let mut request_buffer = [0_u8; 2048];
    let read = stream.read(&mut request_buffer).unwrap_or(0);
    let request = String::from_utf8_lossy(&request_buffer[..read]);
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string()
}

/// Answers from `files`, 404 when `path` is unknown.
fn write_file_response(stream: &mut TcpStream, files: &[(String, Vec<u8>)], path: &str) {
    let response = match files.iter().find(|(served, _)| served == path) {
        Some((_, body)) => {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(body);
            response
        }
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_vec(),
    };
    stream.write_all(&response).expect("must write test response");
    stream.flush().expect("must flush test response");
}

/// Binds a socket under `<root>/ro`, points `ro/ctl` at it and answers one
/// request with `response`. The thread returns the raw request.
fn start_test_daemon(layout: &RootLayout, response: &'static str) -> (JoinHandle<String>, PathBuf) {
    let ro_dir = layout.root().join("ro");
    fs::create_dir_all(&ro_dir).expect("must create ro dir");
    let socket = ro_dir.join("daemon.sock");
    let listener = UnixListener::bind(&socket).expect("must bind test daemon socket");
    std::os::unix::fs::symlink("daemon.sock", layout.ctl_path()).expect("must create ctl link");

    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept daemon client");
        let mut request = Vec::new();
        let mut chunk = [0_u8; 512];
        while !request.ends_with(b"\r\n\r\n{}") {
            let read = stream.read(&mut chunk).expect("must read daemon request");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..read]);
        }
        stream
            .write_all(response.as_bytes())
            .expect("must write daemon response");
        String::from_utf8_lossy(&request).into_owned()
    });

    (handle, socket)
}

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "rootpack-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> RootLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    RootLayout::new(build_test_layout_path(nanos))
}

fn test_repo_root(layout: &RootLayout) -> PathBuf {
    layout.root().join("repo")
}
