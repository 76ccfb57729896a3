//! Process replication: rank identity, progress reporting, rank-gated file
//! output and the teardown barrier.
//!
//! Every rank computes its full shard. Only the primary rank reports and
//! writes; the harness decides that once and hands the pipeline a
//! [`Reporter`] and an [`ArtifactWriter`], so pipeline code never looks at
//! the rank itself.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const BARRIER_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankContext {
    rank: usize,
    world_size: usize,
}

impl RankContext {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(anyhow!("invalid rank {} for world size {}", rank, world_size));
        }
        Ok(Self { rank, world_size })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Reads `RANK` and `WORLD_SIZE`; absent variables mean a single process.
    pub fn from_env() -> Result<Self> {
        fn var(name: &str, default: usize) -> Result<usize> {
            match std::env::var(name) {
                Ok(value) => value
                    .trim()
                    .parse()
                    .with_context(|| format!("{} is not a number: '{}'", name, value)),
                Err(_) => Ok(default),
            }
        }
        Self::new(var("RANK", 0)?, var("WORLD_SIZE", 1)?)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Progress and status sink.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);

    fn progress(&self, stage: &str, step: usize, total: usize) {
        self.info(&format!("{} | step [{}/{}]", stage, step, total));
    }
}

/// Forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn info(&self, message: &str) {
        log::info!("{}", message);
    }
}

/// Drops everything; used on non-primary ranks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn info(&self, _message: &str) {}
}

pub fn reporter_for(ctx: &RankContext) -> Box<dyn Reporter> {
    if ctx.is_primary() {
        Box::new(LogReporter)
    } else {
        Box::new(SilentReporter)
    }
}

/// Writes files on the primary rank and discards them elsewhere.
///
/// Files are written next to their destination and renamed into place, so
/// a reader never sees a partially written artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactWriter {
    enabled: bool,
}

impl ArtifactWriter {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn for_rank(ctx: &RankContext) -> Self {
        Self {
            enabled: ctx.is_primary(),
        }
    }

    /// Runs `write` against `path` when enabled. Returns whether a file was written.
    pub fn write_with<F>(&self, path: &Path, write: F) -> Result<bool>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        if !self.enabled {
            log::debug!("skipping write of {:?} on this rank", path);
            return Ok(false);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }
        let tmp = staging_path(path);
        {
            let file = fs::File::create(&tmp).with_context(|| format!("failed to create {:?}", tmp))?;
            let mut out = BufWriter::new(file);
            write(&mut out)?;
            out.flush().with_context(|| format!("failed to write {:?}", tmp))?;
        }
        fs::rename(&tmp, path).with_context(|| format!("failed to move {:?} into place", path))?;
        Ok(true)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Blocks until every rank has reached the same named point, using marker
/// files in a directory all ranks share. A no-op for a single process.
///
/// Each rank writes `.barrier-{name}-{rank}` on arrival and
/// `.barrier-{name}-{rank}.left` once released; the primary removes both
/// sets after every rank has left, so a completed run leaves no markers.
#[derive(Debug, Clone)]
pub struct FileBarrier {
    dir: PathBuf,
    ctx: RankContext,
}

impl FileBarrier {
    /// Opens the barrier directory and removes this rank's markers left by
    /// an earlier run that did not finish.
    pub fn open(dir: impl Into<PathBuf>, ctx: RankContext) -> Result<Self> {
        let barrier = Self { dir: dir.into(), ctx };
        if ctx.world_size() > 1 {
            barrier.remove_stale()?;
        }
        Ok(barrier)
    }

    fn marker(&self, name: &str, rank: usize) -> PathBuf {
        self.dir.join(format!(".barrier-{}-{}", name, rank))
    }

    fn left_marker(&self, name: &str, rank: usize) -> PathBuf {
        self.dir.join(format!(".barrier-{}-{}.left", name, rank))
    }

    fn remove_stale(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("failed to list {:?}", self.dir)),
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {:?}", self.dir))?;
            let file_name = entry.file_name();
            let owner = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(".barrier-"))
                .map(|n| n.strip_suffix(".left").unwrap_or(n))
                .and_then(|n| n.rsplit_once('-'))
                .and_then(|(_, rank)| rank.parse::<usize>().ok());
            if owner == Some(self.ctx.rank()) {
                log::warn!("removing stale barrier marker {:?}", entry.path());
                fs::remove_file(entry.path())
                    .with_context(|| format!("failed to remove {:?}", entry.path()))?;
            }
        }
        Ok(())
    }

    fn wait_for(&self, paths: &[PathBuf]) {
        while !paths.iter().all(|p| p.exists()) {
            std::thread::sleep(BARRIER_POLL);
        }
    }

    pub fn wait(&self, name: &str) -> Result<()> {
        let world = self.ctx.world_size();
        if world == 1 {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).with_context(|| format!("failed to create {:?}", self.dir))?;
        let rank = self.ctx.rank();
        let own = self.marker(name, rank);
        fs::write(&own, b"").with_context(|| format!("failed to write barrier marker {:?}", own))?;
        log::debug!("rank {} waiting at barrier '{}'", rank, name);

        let arrived: Vec<PathBuf> = (0..world).map(|r| self.marker(name, r)).collect();
        self.wait_for(&arrived);
        log::debug!("rank {} passed barrier '{}'", rank, name);

        if !self.ctx.is_primary() {
            let left = self.left_marker(name, rank);
            fs::write(&left, b"").with_context(|| format!("failed to write barrier marker {:?}", left))?;
            return Ok(());
        }
        // nobody polls the arrival markers once every other rank has left
        let left: Vec<PathBuf> = (1..world).map(|r| self.left_marker(name, r)).collect();
        self.wait_for(&left);
        for path in arrived.iter().chain(&left) {
            fs::remove_file(path).with_context(|| format!("failed to remove barrier marker {:?}", path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Reporter for Recording {
        fn info(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_rank_validation() {
        assert!(RankContext::new(0, 1).unwrap().is_primary());
        assert!(!RankContext::new(1, 2).unwrap().is_primary());
        assert!(RankContext::new(2, 2).is_err());
        assert!(RankContext::new(0, 0).is_err());
    }

    #[test]
    fn test_progress_format() {
        let reporter = Recording::default();
        reporter.progress("Generate", 3, 10);
        assert_eq!(reporter.0.lock().unwrap()[0], "Generate | step [3/10]");
    }

    #[test]
    fn test_artifact_writer_gating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");

        let skipped = ArtifactWriter::for_rank(&RankContext::new(1, 2).unwrap())
            .write_with(&path, |w| Ok(w.write_all(b"x")?))
            .unwrap();
        assert!(!skipped);
        assert!(!path.exists());

        let written = ArtifactWriter::enabled()
            .write_with(&path, |w| Ok(w.write_all(b"hello")?))
            .unwrap();
        assert!(written);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "old").unwrap();
        let result = ArtifactWriter::enabled().write_with(&path, |_| Err(anyhow!("boom")));
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }

    fn markers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".barrier-"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_barrier_releases_all_ranks() {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let dir = Arc::clone(&dir);
                std::thread::spawn(move || {
                    let ctx = RankContext::new(rank, 3).unwrap();
                    let barrier = FileBarrier::open(dir.path(), ctx).unwrap();
                    barrier.wait("candidates").unwrap();
                    barrier.wait("teardown").unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(markers(dir.path()).is_empty());
    }

    #[test]
    fn test_stale_markers_do_not_release_barrier() {
        let dir = tempfile::tempdir().unwrap();
        for stale in [".barrier-teardown-0", ".barrier-teardown-1", ".barrier-teardown-1.left"] {
            fs::write(dir.path().join(stale), b"").unwrap();
        }

        let primary = FileBarrier::open(dir.path(), RankContext::new(0, 2).unwrap()).unwrap();
        let secondary = FileBarrier::open(dir.path(), RankContext::new(1, 2).unwrap()).unwrap();
        assert!(markers(dir.path()).is_empty());

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let handle = std::thread::spawn(move || {
            primary.wait("teardown").unwrap();
            flag.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(!released.load(Ordering::SeqCst));

        secondary.wait("teardown").unwrap();
        handle.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert!(markers(dir.path()).is_empty());
    }

    #[test]
    fn test_open_keeps_other_ranks_markers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".barrier-candidates-1"), b"").unwrap();
        fs::write(dir.path().join(".barrier-candidates-10"), b"").unwrap();
        FileBarrier::open(dir.path(), RankContext::new(1, 11).unwrap()).unwrap();
        assert_eq!(markers(dir.path()), vec![".barrier-candidates-10".to_string()]);
    }

    #[test]
    fn test_single_process_barrier_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        FileBarrier::open(dir.path().join("never"), RankContext::single())
            .unwrap()
            .wait("teardown")
            .unwrap();
        assert!(!dir.path().join("never").exists());
    }
}
