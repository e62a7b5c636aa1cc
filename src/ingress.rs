//! Watch-directory ingress.
//!
//! External producers drop `.txt` + `.jpg` pairs into the watch directory.
//! Each cycle moves complete, validated pairs into the work directory and
//! everything else into the error directory. Publication into work is a
//! two-phase protocol (`.part` staging names plus a `.pairlock` sentinel)
//! so a concurrent grouping scan can never observe half a pair.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::config::{Config, IngressConfig, SpGroup};
use crate::error::Result;
use crate::mapping::Mapper;

/// Outcome of one ingest cycle.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub moved_to_work: Vec<PathBuf>,
    pub moved_to_error: Vec<PathBuf>,
}

/// Moves validated pairs from watch to work, rejects to error.
pub struct Ingress {
    watch_dir: PathBuf,
    work_dir: PathBuf,
    error_dir: PathBuf,
    cfg: IngressConfig,
    groups: Vec<SpGroup>,
    mapper: Mapper,
    #[cfg(test)]
    fail_before_publish: std::sync::atomic::AtomicBool,
}

impl Ingress {
    /// Build from the loaded configuration.
    pub fn new(cfg: &Config, mapper: Mapper) -> Ingress {
        Ingress {
            watch_dir: cfg.grouping.watch_dir.clone(),
            work_dir: cfg.grouping.work_dir.clone(),
            error_dir: cfg.grouping.error_dir.clone(),
            cfg: cfg.ingress.clone(),
            groups: cfg.sp_mapping.groups.clone(),
            mapper,
            #[cfg(test)]
            fail_before_publish: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Run one ingest cycle over the watch directory.
    ///
    /// Per-pair failures are logged and never abort the cycle.
    pub fn ingest_batch(&self) -> Result<IngestReport> {
        fs::create_dir_all(&self.work_dir)?;
        fs::create_dir_all(&self.error_dir)?;

        let ready = self.ready_files()?;

        // stem -> extension -> path, allowed extensions only
        let mut by_stem: HashMap<String, HashMap<String, PathBuf>> = HashMap::new();
        for path in &ready {
            let Some(ext) = dotted_ext(path) else { continue };
            if !self.allowed(&ext) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            by_stem
                .entry(stem.to_string())
                .or_default()
                .insert(ext, path.clone());
        }

        let mut report = IngestReport::default();
        let mut processed: Vec<String> = Vec::new();

        for (stem, parts) in &by_stem {
            let Some(txt) = parts.get(".txt") else { continue };
            let img = parts.get(".jpg").or_else(|| parts.get(".jpeg"));
            let Some(img) = img else { continue };

            if let Some(reason) = self.validate_pair(txt) {
                warn!(stem = %stem, reason = %reason, "reject pair");
                self.move_pair_to_error(txt, img, &mut report);
                processed.push(stem.clone());
                continue;
            }

            if !self.cfg.atomic_pair_enabled {
                match self.move_pair_direct(txt, img, &mut report) {
                    Ok(()) => processed.push(stem.clone()),
                    Err(e) => {
                        error!(stem = %stem, "direct move failed: {e}");
                        self.move_pair_to_error(txt, img, &mut report);
                    }
                }
                continue;
            }

            match self.publish_pair(stem, txt, img, &mut report) {
                Ok(()) => processed.push(stem.clone()),
                Err(e) => {
                    error!(stem = %stem, "two-phase publish failed: {e}");
                    self.rollback_pair(stem, txt, img, &mut report);
                }
            }
        }

        // Ready, typed, but incomplete or unsupported files go to error.
        for path in &ready {
            if !path.exists() {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if processed.contains(&stem) {
                continue;
            }
            let unsupported = dotted_ext(path).map_or(true, |ext| !self.allowed(&ext));
            let incomplete = !by_stem.get(&stem).is_some_and(|parts| {
                parts.contains_key(".txt")
                    && (parts.contains_key(".jpg") || parts.contains_key(".jpeg"))
            });
            if unsupported || incomplete {
                if let Ok(moved) = self.atomic_move_to_dir(path, &self.error_dir) {
                    report.moved_to_error.push(moved);
                }
            }
        }

        Ok(report)
    }

    /// Files old enough to be considered fully written, staging names
    /// excluded.
    fn ready_files(&self) -> Result<Vec<PathBuf>> {
        let part_suffix = self.cfg.atomic_pair_suffixes.part_suffix.to_lowercase();
        let lock_suffix = self.cfg.atomic_pair_suffixes.lock_suffix.to_lowercase();
        let now = SystemTime::now();
        let mut ready = Vec::new();
        for entry in fs::read_dir(&self.watch_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_lowercase();
            if name.ends_with(&part_suffix) || name.ends_with(&lock_suffix) {
                continue;
            }
            let mtime = path.metadata()?.modified()?;
            let age_ms = now
                .duration_since(mtime)
                .map_or(0, |age| age.as_millis() as u64);
            if age_ms >= self.cfg.ready_quiet_ms {
                ready.push(path);
            }
        }
        Ok(ready)
    }

    fn allowed(&self, dotted: &str) -> bool {
        self.cfg
            .allowed_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(dotted))
    }

    /// Parse and range-check the table; `Some(reason)` rejects the pair.
    fn validate_pair(&self, txt: &Path) -> Option<String> {
        let rows = match self.mapper.parse_rows(txt) {
            Ok(rows) => rows,
            Err(e) => return Some(e.to_string()),
        };
        if rows.is_empty() {
            return Some("empty indices".to_string());
        }
        if !self.groups.is_empty() {
            for row in &rows {
                if !self.groups.iter().any(|g| g.contains(row.sp)) {
                    return Some(format!("index {} out of groups", row.sp));
                }
            }
        }
        None
    }

    fn move_pair_to_error(&self, txt: &Path, img: &Path, report: &mut IngestReport) {
        for path in [txt, img] {
            match self.atomic_move_to_dir(path, &self.error_dir) {
                Ok(moved) => report.moved_to_error.push(moved),
                Err(e) => error!("move to error failed for {}: {e}", path.display()),
            }
        }
    }

    fn move_pair_direct(&self, txt: &Path, img: &Path, report: &mut IngestReport) -> Result<()> {
        let moved_txt = self.atomic_move_to_dir(txt, &self.work_dir)?;
        report.moved_to_work.push(moved_txt);
        let moved_img = self.atomic_move_to_dir(img, &self.work_dir)?;
        report.moved_to_work.push(moved_img);
        Ok(())
    }

    /// Two-phase publish: stage `.part` copies and the pair lock, then
    /// rename both to their final names and drop the lock.
    fn publish_pair(
        &self,
        stem: &str,
        txt: &Path,
        img: &Path,
        report: &mut IngestReport,
    ) -> Result<()> {
        let part = &self.cfg.atomic_pair_suffixes.part_suffix;
        let lock = &self.cfg.atomic_pair_suffixes.lock_suffix;
        let part_txt = self.work_dir.join(format!("{}{part}", file_name(txt)));
        let part_img = self.work_dir.join(format!("{}{part}", file_name(img)));
        let pairlock = self.work_dir.join(format!("{stem}{lock}"));
        let final_txt = self.work_dir.join(file_name(txt));
        let final_img = self.work_dir.join(file_name(img));

        move_or_copy(txt, &part_txt)?;
        move_or_copy(img, &part_img)?;
        fs::File::create(&pairlock)?;

        #[cfg(test)]
        if self
            .fail_before_publish
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(io::Error::other("injected publish failure").into());
        }

        fs::rename(&part_txt, &final_txt)?;
        fs::rename(&part_img, &final_img)?;
        if let Err(e) = fs::remove_file(&pairlock) {
            if pairlock.exists() {
                warn!("pair lock removal failed: {e}");
            }
        }
        report.moved_to_work.push(final_txt);
        report.moved_to_work.push(final_img);
        Ok(())
    }

    /// Best-effort cleanup after a failed publish: surviving `.part` files
    /// land in error under their final names, the lock goes away, and any
    /// sources still in watch follow to error.
    fn rollback_pair(&self, stem: &str, txt: &Path, img: &Path, report: &mut IngestReport) {
        let part = &self.cfg.atomic_pair_suffixes.part_suffix;
        let lock = &self.cfg.atomic_pair_suffixes.lock_suffix;
        for src in [txt, img] {
            let staged = self.work_dir.join(format!("{}{part}", file_name(src)));
            if staged.exists() {
                let target = self.error_dir.join(file_name(src));
                if fs::rename(&staged, &target).is_ok() {
                    report.moved_to_error.push(target);
                } else if let Err(e) = fs::remove_file(&staged) {
                    error!("rollback cleanup failed for {}: {e}", staged.display());
                }
            }
        }
        let pairlock = self.work_dir.join(format!("{stem}{lock}"));
        if pairlock.exists() {
            let _ = fs::remove_file(&pairlock);
        }
        for src in [txt, img] {
            if src.exists() {
                if let Ok(moved) = self.atomic_move_to_dir(src, &self.error_dir) {
                    report.moved_to_error.push(moved);
                }
            }
        }
    }

    /// See [`atomic_move_to_dir`].
    pub fn atomic_move_to_dir(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf> {
        atomic_move_to_dir(src, dst_dir)
    }

    #[cfg(test)]
    fn inject_publish_failure(&self) {
        self.fail_before_publish
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Atomic move into `dst_dir`, keeping the source file name.
///
/// Rename first, copy+remove across volumes, and on persistent failure
/// retry under millisecond-unique names a bounded number of times.
pub fn atomic_move_to_dir(src: &Path, dst_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dst_dir)?;
    let dst = dst_dir.join(file_name(src));
    match move_or_copy(src, &dst) {
        Ok(()) => return Ok(dst),
        Err(e) => debug!("move {} -> {}: {e}, retrying", src.display(), dst.display()),
    }
    let stem = src
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let ext = dotted_ext(src).unwrap_or_default();
    let mut last: Option<io::Error> = None;
    for attempt in 1..=5 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let candidate = dst_dir.join(format!("{stem}_{millis}_{attempt}{ext}"));
        match move_or_copy(src, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) => last = Some(e),
        }
    }
    Err(last
        .unwrap_or_else(|| io::Error::other("atomic move retries exhausted"))
        .into())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

fn dotted_ext(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}

/// Rename, falling back to copy+remove for cross-volume moves.
fn move_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct Fixture {
        _root: tempfile::TempDir,
        cfg: Config,
    }

    impl Fixture {
        fn new() -> Fixture {
            let root = tempfile::tempdir().unwrap();
            let mut cfg = Config::default();
            cfg.grouping.watch_dir = root.path().join("watch");
            cfg.grouping.work_dir = root.path().join("work");
            cfg.grouping.error_dir = root.path().join("error");
            cfg.grouping.done_dir = root.path().join("done");
            fs::create_dir_all(&cfg.grouping.watch_dir).unwrap();
            Fixture { _root: root, cfg }
        }

        fn ingress(&self) -> Ingress {
            Ingress::new(&self.cfg, Mapper::new(&self.cfg).unwrap())
        }

        fn drop_pair(&self, stem: &str, body: &str) {
            fs::write(self.cfg.grouping.watch_dir.join(format!("{stem}.txt")), body).unwrap();
            fs::write(self.cfg.grouping.watch_dir.join(format!("{stem}.jpg")), b"jpeg").unwrap();
        }

        fn names_in(&self, dir: &Path) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(dir)
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }
    }

    #[test]
    fn test_valid_pair_published_atomically() {
        let fx = Fixture::new();
        fx.drop_pair("foo", "1 SP1 10%\n2 SP2 20%\n");
        let report = fx.ingress().ingest_batch().unwrap();
        assert_eq!(report.moved_to_work.len(), 2);
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.work_dir),
            vec!["foo.jpg", "foo.txt"]
        );
        // No staging residue and nothing left in watch.
        assert!(fx.names_in(&fx.cfg.grouping.watch_dir).is_empty());
        assert!(fx.names_in(&fx.cfg.grouping.error_dir).is_empty());
    }

    #[test]
    fn test_unparsable_pair_rejected() {
        let fx = Fixture::new();
        fx.drop_pair("bad", "this is not a table\n");
        let report = fx.ingress().ingest_batch().unwrap();
        assert!(report.moved_to_work.is_empty());
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.error_dir),
            vec!["bad.jpg", "bad.txt"]
        );
    }

    #[test]
    fn test_out_of_group_index_rejected() {
        let fx = Fixture::new();
        // SP 5000 is outside every configured group.
        fx.drop_pair("oob", "1 SP5000 10%\n");
        fx.ingress().ingest_batch().unwrap();
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.error_dir),
            vec!["oob.jpg", "oob.txt"]
        );
        assert!(fx.names_in(&fx.cfg.grouping.work_dir).is_empty());
    }

    #[test]
    fn test_unpaired_file_goes_to_error() {
        let fx = Fixture::new();
        fs::write(fx.cfg.grouping.watch_dir.join("lonely.txt"), "1 SP1 5%\n").unwrap();
        fs::write(fx.cfg.grouping.watch_dir.join("strange.bin"), b"?").unwrap();
        fx.ingress().ingest_batch().unwrap();
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.error_dir),
            vec!["lonely.txt", "strange.bin"]
        );
    }

    #[test]
    fn test_staging_suffixes_ignored() {
        let fx = Fixture::new();
        fs::write(fx.cfg.grouping.watch_dir.join("x.txt.part"), b"x").unwrap();
        fs::write(fx.cfg.grouping.watch_dir.join("x.pairlock"), b"").unwrap();
        fx.ingress().ingest_batch().unwrap();
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.watch_dir),
            vec!["x.pairlock", "x.txt.part"]
        );
        assert!(fx.names_in(&fx.cfg.grouping.error_dir).is_empty());
    }

    #[test]
    fn test_quiet_window_defers_fresh_files() {
        let mut fx = Fixture::new();
        fx.cfg.ingress.ready_quiet_ms = 60_000;
        fx.drop_pair("fresh", "1 SP1 10%\n");
        let report = fx.ingress().ingest_batch().unwrap();
        assert!(report.moved_to_work.is_empty());
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.watch_dir),
            vec!["fresh.jpg", "fresh.txt"]
        );
    }

    #[test]
    fn test_publish_failure_rolls_back_to_error() {
        let fx = Fixture::new();
        fx.drop_pair("foo", "1 SP1 10%\n");
        let ingress = fx.ingress();
        ingress.inject_publish_failure();
        ingress.ingest_batch().unwrap();
        // Nothing under final names in work, no lock residue, pair in error.
        assert!(fx.names_in(&fx.cfg.grouping.work_dir).is_empty());
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.error_dir),
            vec!["foo.jpg", "foo.txt"]
        );
    }

    #[test]
    fn test_direct_move_mode() {
        let mut fx = Fixture::new();
        fx.cfg.ingress.atomic_pair_enabled = false;
        fx.drop_pair("plain", "1 SP1 10%\n");
        let report = fx.ingress().ingest_batch().unwrap();
        assert_eq!(report.moved_to_work.len(), 2);
        assert_eq!(
            fx.names_in(&fx.cfg.grouping.work_dir),
            vec!["plain.jpg", "plain.txt"]
        );
    }

    #[test]
    fn test_atomic_move_keeps_name() {
        let fx = Fixture::new();
        let src = fx.cfg.grouping.watch_dir.join("m.txt");
        fs::write(&src, b"data").unwrap();
        let ingress = fx.ingress();
        let moved = ingress
            .atomic_move_to_dir(&src, &fx.cfg.grouping.done_dir)
            .unwrap();
        assert!(moved.ends_with("m.txt"));
        assert!(!src.exists());
        assert_eq!(fs::read(moved).unwrap(), b"data");
    }
}
