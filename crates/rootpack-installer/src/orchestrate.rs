use std::fs;
use std::io;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rootpack_core::{split_full_name, DEFAULT_ARCH};
use rootpack_registry::RepositorySet;
use rootpack_resolver::{expand, InstallSet};
use tracing::info;

use crate::counter::ByteCounter;
use crate::daemon::{notify_daemon, DaemonNotification};
use crate::layout::RootLayout;
use crate::transaction::{install_artifact, ArtifactOutcome};

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub default_arch: String,
    /// Caps the tasks running at once across the whole run. `None` gives
    /// every request and every artifact its own worker.
    pub jobs: Option<usize>,
    pub notify_daemon: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            default_arch: DEFAULT_ARCH.to_string(),
            jobs: None,
            notify_daemon: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    pub name: String,
    pub outcome: ArtifactOutcome,
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub sets: Vec<InstallSet>,
    pub artifacts: Vec<ArtifactReport>,
    pub bytes: u64,
    pub elapsed: Duration,
    pub daemon: Option<DaemonNotification>,
}

impl InstallReport {
    pub fn installed_count(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|artifact| artifact.outcome == ArtifactOutcome::Installed)
            .count()
    }

    pub fn mib_per_sec(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / seconds / (1024.0 * 1024.0)
    }
}

/// Installs every request and its runtime dependencies into `layout`.
///
/// Every request runs to completion even when a sibling fails; the first
/// failure in request order is returned and committed packages stay in place.
pub fn install_packages(
    layout: &RootLayout,
    repos: &RepositorySet,
    requests: &[String],
    options: &InstallOptions,
) -> Result<InstallReport> {
    let started = Instant::now();
    let counter = ByteCounter::new();
    layout.reset_tmp_dir()?;

    let workers = Workers::new(options.jobs)?;
    let results: Vec<Result<(InstallSet, Vec<ArtifactReport>)>> =
        workers.run(requests, |request| {
            install_request(layout, repos, request, options, &workers, &counter)
        })?;

    let mut sets = Vec::with_capacity(results.len());
    let mut artifacts = Vec::new();
    for result in results {
        let (set, reports) = result?;
        sets.push(set);
        artifacts.extend(reports);
    }
    ensure_committed(layout, &sets)?;

    let daemon = if options.notify_daemon {
        Some(notify_daemon(layout)?)
    } else {
        None
    };

    let report = InstallReport {
        sets,
        artifacts,
        bytes: counter.get(),
        elapsed: started.elapsed(),
        daemon,
    };
    info!(
        "done, {:.2} MB/s ({} bytes in {:?})",
        report.mib_per_sec(),
        report.bytes,
        report.elapsed
    );
    Ok(report)
}

fn install_request(
    layout: &RootLayout,
    repos: &RepositorySet,
    request: &str,
    options: &InstallOptions,
    workers: &Workers,
    counter: &ByteCounter,
) -> Result<(InstallSet, Vec<ArtifactReport>)> {
    let set = expand(repos, request, &options.default_arch)
        .with_context(|| format!("failed to resolve {request}"))?;
    let repo = repos
        .get(set.repository)
        .ok_or_else(|| anyhow!("repository {} is not configured", set.repository))?;

    let results: Vec<Result<ArtifactReport>> = workers.run(&set.artifacts, |name| {
        let first_install = is_first_install(layout, name)?;
        let outcome = install_artifact(layout, repo, name, first_install, counter)
            .with_context(|| format!("failed to install {name}"))?;
        Ok(ArtifactReport {
            name: name.clone(),
            outcome,
        })
    })?;
    let reports = results.into_iter().collect::<Result<Vec<_>>>()?;
    Ok((set, reports))
}

/// Where install tasks run. Uncapped runs size a fresh pool to each fan-out;
/// a `-j` cap shares one pool across the whole run.
enum Workers {
    Uncapped,
    Capped(ThreadPool),
}

impl Workers {
    fn new(jobs: Option<usize>) -> Result<Self> {
        match jobs {
            Some(jobs) => Ok(Self::Capped(worker_pool(jobs)?)),
            None => Ok(Self::Uncapped),
        }
    }

    /// Runs `task` once per item, all of them concurrently up to the cap, and
    /// returns the results in item order.
    fn run<T, R, F>(&self, items: &[T], task: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::Capped(pool) => Ok(spawn_all(pool, items, &task)),
            Self::Uncapped => Ok(spawn_all(&worker_pool(items.len())?, items, &task)),
        }
    }
}

fn worker_pool(threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|index| format!("rootpack-install-{index}"))
        .build()
        .context("failed to start install workers")
}

fn spawn_all<T, R, F>(pool: &ThreadPool, items: &[T], task: &F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let mut slots: Vec<Option<R>> = items.iter().map(|_| None).collect();
    pool.scope(|scope| {
        for (slot, item) in slots.iter_mut().zip(items) {
            scope.spawn(move |_| *slot = Some(task(item)));
        }
    });
    slots.into_iter().flatten().collect()
}

/// Whether no version of the package `name` names (same base name and
/// architecture) is installed yet. Names that do not carry a version count as
/// a first install.
pub fn is_first_install(layout: &RootLayout, name: &str) -> Result<bool> {
    let Some((base, arch, _)) = split_full_name(name) else {
        return Ok(true);
    };

    let roimg_dir = layout.roimg_dir();
    let entries = match fs::read_dir(&roimg_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", roimg_dir.display()))
        }
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", roimg_dir.display()))?;
        let file_name = entry.file_name();
        let Some(stem) = file_name
            .to_str()
            .and_then(|file_name| file_name.strip_suffix(".squashfs"))
        else {
            continue;
        };
        if let Some((installed_base, installed_arch, _)) = split_full_name(stem) {
            if installed_base == base && installed_arch == arch {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Deferred artifacts are left to a concurrent installer; by the end of the
/// run each of them must have been committed by someone.
pub(crate) fn ensure_committed(layout: &RootLayout, sets: &[InstallSet]) -> Result<()> {
    for set in sets {
        for name in &set.artifacts {
            if !layout.is_installed(name)? {
                return Err(anyhow!(
                    "package {name} was deferred to a concurrent installer but is not installed"
                ));
            }
        }
    }
    Ok(())
}
