//! Triplet assembly from the work directory.
//!
//! Jobs arrive as matching-stem `.txt` + `.jpg`/`.jpeg` pairs. Pairs are
//! sorted by stem and consumed three at a time; chunk position decides the
//! color channel. The terminal chunk may be partial; because the dispatcher
//! rebuilds groups from scratch each cycle, a partial tail completes
//! naturally once more pairs land.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GroupingConfig;
use crate::error::{LedlinkError, Result};

/// Color channel of a painting inside a triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Color {
    R,
    G,
    B,
}

impl Color {
    /// Wire color code: 0 red, 1 green, 2 blue.
    pub fn code(self) -> u8 {
        match self {
            Color::R => 0,
            Color::G => 1,
            Color::B => 2,
        }
    }
}

/// The two files making up one painting job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPair {
    pub txt: PathBuf,
    pub img: PathBuf,
}

/// Up to three paired jobs, one per color channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triplet {
    /// Derived from the first stem; log display only.
    pub key: String,
    pub files: BTreeMap<Color, JobPair>,
}

/// Scans a work directory into color triplets.
pub struct Grouping {
    color_order: Vec<Color>,
    name_tag_regex: regex::Regex,
}

impl Grouping {
    /// Build from the grouping configuration. Fails on a bad key regex.
    pub fn new(cfg: &GroupingConfig) -> Result<Grouping> {
        let name_tag_regex = RegexBuilder::new(&cfg.name_tag_regex)
            .case_insensitive(true)
            .build()
            .map_err(|e| LedlinkError::config(format!("grouping.name_tag_regex: {e}")))?;
        Ok(Grouping {
            color_order: cfg.color_order.clone(),
            name_tag_regex,
        })
    }

    /// Collect the current triplets from `work_dir` in stable stem order.
    ///
    /// Stems with a `.pairlock` sibling are in-flight and excluded.
    pub fn scan(&self, work_dir: &Path) -> Result<Vec<Triplet>> {
        let mut txts: HashMap<String, PathBuf> = HashMap::new();
        let mut imgs: HashMap<String, PathBuf> = HashMap::new();
        let mut locks: HashSet<String> = HashSet::new();
        for entry in std::fs::read_dir(work_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            match ext.to_ascii_lowercase().as_str() {
                "txt" => {
                    txts.insert(stem.to_string(), path);
                }
                "jpg" | "jpeg" => {
                    imgs.insert(stem.to_string(), path);
                }
                "pairlock" => {
                    locks.insert(stem.to_string());
                }
                _ => {}
            }
        }

        let mut stems: Vec<String> = txts
            .keys()
            .filter(|stem| imgs.contains_key(*stem) && !locks.contains(*stem))
            .cloned()
            .collect();
        stems.sort();

        let mut triplets = Vec::new();
        for chunk in stems.chunks(3) {
            let mut files = BTreeMap::new();
            for (pos, stem) in chunk.iter().enumerate() {
                let color = self.color_order[pos];
                debug!(stem = %stem, color = ?color, "assign");
                files.insert(
                    color,
                    JobPair {
                        txt: txts[stem].clone(),
                        img: imgs[stem].clone(),
                    },
                );
            }
            triplets.push(Triplet {
                key: self.derive_key(&chunk[0]),
                files,
            });
        }
        Ok(triplets)
    }

    /// Strip the trailing `-N<digits>` tag when present, otherwise drop the
    /// last hyphen segment.
    fn derive_key(&self, stem: &str) -> String {
        if let Some(caps) = self.name_tag_regex.captures(stem) {
            let a = caps.name("a").map_or("", |m| m.as_str());
            return match caps.name("b") {
                Some(b) => format!("{a}-{}", b.as_str()),
                None => a.to_string(),
            };
        }
        match stem.rsplit_once('-') {
            Some((head, _)) => head.to_string(),
            None => stem.to_string(),
        }
    }
}
