//! SP table parsing and SP→LED geometry.
//!
//! Input rows name slot positions (SP numbers). The wall is wired in
//! serpentine row order, one address block per SP group, three LEDs per
//! slot (one per color channel). [`Mapper::compute_led_ids_for_sp`] turns an
//! SP into its LED triple; composition picks the channel matching the job's
//! color.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use tracing::{debug, info};

use crate::config::{Config, RowDirection, SpGroup, SpMappingConfig, StartCorner};
use crate::error::{LedlinkError, Result};
use crate::grouping::{Color, Triplet};

/// One parsed table row: slot position and area percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobRow {
    pub sp: u32,
    pub percent: f64,
}

/// A composed A1 payload: LED indices with optional aligned attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub indices: Vec<u16>,
    /// Blink bits, present only when at least one item blinks.
    pub attrs: Option<Vec<u8>>,
    /// Wire color codes aligned with `indices`.
    pub colors: Option<Vec<u8>>,
}

impl Payload {
    /// The empty payload sent when no work is queued.
    pub fn empty() -> Payload {
        Payload::default()
    }
}

/// Parses job tables and remaps slot positions to LED ids.
#[derive(Clone)]
pub struct Mapper {
    row_re: Regex,
    alt_re: Regex,
    header_keywords: Vec<String>,
    allowed_prefixes: Vec<String>,
    spm: SpMappingConfig,
    blink_enabled: bool,
    blink_threshold: f64,
    color_order: Vec<Color>,
}

impl Mapper {
    /// Build from the loaded configuration. Fails on malformed patterns.
    pub fn new(cfg: &Config) -> Result<Mapper> {
        let row_re = RegexBuilder::new(&cfg.parsing.row_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| LedlinkError::config(format!("parsing.row_pattern: {e}")))?;
        let alt_re = RegexBuilder::new(&cfg.parsing.alt_row_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| LedlinkError::config(format!("parsing.alt_row_pattern: {e}")))?;
        Ok(Mapper {
            row_re,
            alt_re,
            header_keywords: cfg.parsing.header_keywords.clone(),
            allowed_prefixes: cfg.parsing.allowed_code_prefix.clone(),
            spm: cfg.sp_mapping.clone(),
            blink_enabled: cfg.display.blink_enabled,
            blink_threshold: cfg.display.blink_threshold_percent,
            color_order: cfg.effective_color_order(),
        })
    }

    /// Parse the `<row#> <prefix><digits> <percent>%` table in `path`.
    ///
    /// A missing file yields an empty row list. The first line is skipped
    /// when it carries a header keyword; rows with a prefix outside
    /// `allowed_code_prefix` are silently ignored; anything else that fails
    /// to parse, duplicates an SP, or leaves the 0..=100 percent range is a
    /// [`LedlinkError::ParseRow`].
    pub fn parse_rows(&self, path: &Path) -> Result<Vec<JobRow>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);

        let row_error = |line: usize, reason: String| LedlinkError::ParseRow {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut rows: Vec<JobRow> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let caps = match self.row_re.captures(line) {
                Some(caps) => caps,
                None => {
                    let lower = line.to_lowercase();
                    if lineno == 1
                        && self
                            .header_keywords
                            .iter()
                            .any(|kw| lower.contains(&kw.to_lowercase()))
                    {
                        continue;
                    }
                    match self.alt_re.captures(line) {
                        Some(caps) => caps,
                        None => {
                            return Err(row_error(lineno, format!("unrecognized row '{line}'")))
                        }
                    }
                }
            };
            let prefix = caps.get(1).map_or("", |m| m.as_str());
            if !self.allowed_prefixes.iter().any(|p| p == prefix) {
                continue;
            }
            let sp: u32 = caps
                .get(2)
                .map_or("", |m| m.as_str())
                .parse()
                .map_err(|_| row_error(lineno, format!("bad cell code '{line}'")))?;
            if rows.iter().any(|row| row.sp == sp) {
                return Err(row_error(lineno, format!("duplicate index {sp}")));
            }
            let percent: f64 = caps
                .get(3)
                .map_or("", |m| m.as_str())
                .parse()
                .map_err(|_| row_error(lineno, format!("bad percent '{line}'")))?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(row_error(lineno, format!("out-of-range percent {percent}")));
            }
            rows.push(JobRow { sp, percent });
        }
        Ok(rows)
    }

    /// The declared group containing `sp`, if any.
    pub fn find_sp_group(&self, sp: u32) -> Option<&SpGroup> {
        self.spm.groups.iter().find(|g| g.contains(sp))
    }

    /// Serpentine position of `pos` (1-based) inside a block, and whether
    /// the row runs right-to-left.
    fn serpentine_pos_in_block(&self, pos: u32, cols_per_row: u32) -> (u32, bool) {
        let cols = cols_per_row.max(1);
        let r = (pos - 1) / cols;
        let c = (pos - 1) % cols;
        let mut dir = if r % 2 == 0 {
            self.spm.row_direction_even
        } else {
            self.spm.row_direction_odd
        };
        if matches!(self.spm.start_corner, StartCorner::Tr | StartCorner::Br) {
            dir = dir.flipped();
        }
        match dir {
            RowDirection::Lr => (r * cols + c + 1, false),
            RowDirection::Rl => (r * cols + (cols - 1 - c) + 1, true),
        }
    }

    /// LED triple for one slot position inside its group.
    ///
    /// `pos = sp - start_sp + 1`, serpentine within the block, then
    /// `serp_global = (id-1)*block_size + serp_in_block` and
    /// `base = (serp_global-1)*leds_per_slot + 1`. The triple runs
    /// `(base, base+1, base+2)` on reversed rows and `(base+2, base+1, base)`
    /// otherwise, keeping channel order aligned with the physical wiring.
    pub fn compute_led_ids_for_sp(&self, sp: u32, group: &SpGroup) -> (u32, u32, u32) {
        let pos = sp - group.start_sp + 1;
        let (serp_in_block, reverse) = self.serpentine_pos_in_block(pos, group.cols_per_row);
        let serp_global = (group.id - 1) * self.spm.block_size + serp_in_block;
        let base = (serp_global - 1) * self.spm.leds_per_slot + 1;
        if reverse {
            (base, base + 1, base + 2)
        } else {
            (base + 2, base + 1, base)
        }
    }

    /// Compose the A1 payload for a triplet.
    ///
    /// Colors are visited in the configured order; each present color's rows
    /// contribute the channel LED for their SP. Rows whose SP falls in no
    /// group are skipped (ingress validated them already). Blink bits are
    /// set per item when the percent reaches the display threshold; the
    /// attrs vector is dropped entirely when nothing blinks.
    pub fn compose_payload(&self, triplet: &Triplet) -> Result<Payload> {
        let mut indices: Vec<u16> = Vec::new();
        let mut colors: Vec<u8> = Vec::new();
        let mut percents: Vec<f64> = Vec::new();
        let mut counts = [0usize; 3];

        for &color in &self.color_order {
            let Some(pair) = triplet.files.get(&color) else {
                continue;
            };
            for row in self.parse_rows(&pair.txt)? {
                let Some(group) = self.find_sp_group(row.sp) else {
                    debug!(sp = row.sp, "sp outside every group, skipping");
                    continue;
                };
                let (led1, led2, led3) = self.compute_led_ids_for_sp(row.sp, group);
                let led = match color {
                    Color::R => led1,
                    Color::G => led2,
                    Color::B => led3,
                };
                indices.push(led as u16);
                colors.push(color.code());
                percents.push(row.percent);
                counts[color.code() as usize] += 1;
            }
        }

        let mut attrs: Option<Vec<u8>> = None;
        let mut blink_count = 0usize;
        if self.blink_enabled {
            let bits: Vec<u8> = percents
                .iter()
                .map(|&pct| u8::from(pct >= self.blink_threshold))
                .collect();
            blink_count = bits.iter().filter(|&&b| b != 0).count();
            if blink_count > 0 {
                attrs = Some(bits);
            }
        }

        info!(
            key = %triplet.key,
            r = counts[0],
            g = counts[1],
            b = counts[2],
            total = indices.len(),
            blink = blink_count,
            "composed payload"
        );

        let colors = if colors.is_empty() { None } else { Some(colors) };
        Ok(Payload {
            indices,
            attrs,
            colors,
        })
    }
}
