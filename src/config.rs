//! Typed configuration tree.
//!
//! The whole tree deserializes from a single JSON file; every field has a
//! default so a partial file (or no file at all) still yields a runnable
//! configuration. Malformed fields are rejected at load time by
//! [`Config::validate`], never at first use.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LedlinkError, Result};
use crate::grouping::Color;

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV: &str = "LEDLINK_CONFIG";

/// Fallback configuration path when neither CLI nor environment name one.
pub const DEFAULT_CONFIG_PATH: &str = "configs/default.json";

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub comm: CommConfig,
    pub grouping: GroupingConfig,
    pub ingress: IngressConfig,
    pub parsing: ParsingConfig,
    pub sp_mapping: SpMappingConfig,
    pub display: DisplayConfig,
    pub dispatcher: DispatcherConfig,
    pub serial: SerialConfig,
    pub logging: LoggingConfig,
    pub printing: PrintingConfig,
}

/// Session and heartbeat parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Start the heartbeat scheduler when a session is created.
    pub enable_heartbeat: bool,
    pub heartbeat_interval_seconds: f64,
    /// Consecutive send failures before the session goes offline.
    pub offline_failure_threshold: u32,
    /// Maximum A1 VAL bytes per frame.
    pub bytes_per_frame: usize,
    /// Delay between A1 chunks.
    pub inter_frame_gap_ms: u64,
    /// Per-A1-chunk ACK timeout.
    pub cmd_timeout_ms: u64,
    /// Generic ACK wait timeout when the retry policy is disabled.
    pub ack_timeout_ms: u64,
    pub duplicate_ack_mode: DuplicateAckMode,
    pub retry: RetryConfig,
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig {
            enable_heartbeat: true,
            heartbeat_interval_seconds: 10.0,
            offline_failure_threshold: 10,
            bytes_per_frame: 512,
            inter_frame_gap_ms: 10,
            cmd_timeout_ms: 2000,
            ack_timeout_ms: 1000,
            duplicate_ack_mode: DuplicateAckMode::DuplicateCode,
            retry: RetryConfig::default(),
        }
    }
}

/// Reply mode for a repeated B1 sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAckMode {
    /// Answer with the dedicated duplicate code (wire 0x02).
    DuplicateCode,
    /// Echo whatever code the original B1 was answered with.
    EchoLast,
}

/// ACK wait retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Per-attempt ACK wait.
    pub ack_timeout_ms: u64,
    /// Sleep between attempts.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            enabled: true,
            max_attempts: 3,
            ack_timeout_ms: 300,
            backoff_ms: 50,
        }
    }
}

/// Pipeline directories and triplet naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub watch_dir: PathBuf,
    pub work_dir: PathBuf,
    pub done_dir: PathBuf,
    pub error_dir: PathBuf,
    /// Position-to-color assignment inside each chunk of three stems.
    pub color_order: Vec<Color>,
    /// Regex deriving a triplet key from its first stem (log display only).
    pub name_tag_regex: String,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        GroupingConfig {
            watch_dir: PathBuf::from("data/watch"),
            work_dir: PathBuf::from("data/work"),
            done_dir: PathBuf::from("data/done"),
            error_dir: PathBuf::from("data/error"),
            color_order: vec![Color::R, Color::G, Color::B],
            name_tag_regex: r"^(?P<a>[^-]+)(?:-(?P<b>[^-]+))?-(?P<tag>N[0-9]+)$".to_string(),
        }
    }
}

/// Watch-directory ingress discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// A file is ready once its mtime is at least this old.
    pub ready_quiet_ms: u64,
    /// Publish pairs through the `.part` + lock two-phase protocol.
    pub atomic_pair_enabled: bool,
    pub allowed_extensions: Vec<String>,
    pub atomic_pair_suffixes: AtomicPairSuffixes,
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig {
            ready_quiet_ms: 0,
            atomic_pair_enabled: true,
            allowed_extensions: vec![".txt".into(), ".jpg".into(), ".jpeg".into()],
            atomic_pair_suffixes: AtomicPairSuffixes::default(),
        }
    }
}

/// Reserved staging suffixes; consumers skip files carrying them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomicPairSuffixes {
    pub part_suffix: String,
    pub lock_suffix: String,
}

impl Default for AtomicPairSuffixes {
    fn default() -> Self {
        AtomicPairSuffixes {
            part_suffix: ".part".to_string(),
            lock_suffix: ".pairlock".to_string(),
        }
    }
}

/// Job file row parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingConfig {
    /// Captures `(prefix, digits, percent)` from a numbered table row.
    pub row_pattern: String,
    /// Fallback pattern without the leading row number.
    pub alt_row_pattern: String,
    /// A first line containing any of these is treated as the table header.
    pub header_keywords: Vec<String>,
    /// Rows whose captured prefix is not listed here are ignored.
    pub allowed_code_prefix: Vec<String>,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        ParsingConfig {
            row_pattern: r"^\s*(?:\d+)\s+([A-Za-z]+)(\d+)\s+([\d]+(?:\.\d+)?)\s*%\s*$".to_string(),
            alt_row_pattern: r"^\s*([A-Za-z]+)(\d+)\s+([\d]+(?:\.\d+)?)\s*%\s*$".to_string(),
            header_keywords: vec!["编号".into(), "名称".into(), "百分".into()],
            allowed_code_prefix: vec!["SP".into(), "X".into()],
        }
    }
}

/// Physical geometry of the LED wall.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpMappingConfig {
    /// LED address slots reserved per group.
    pub block_size: u32,
    pub leds_per_slot: u32,
    pub start_corner: StartCorner,
    pub row_direction_even: RowDirection,
    pub row_direction_odd: RowDirection,
    pub groups: Vec<SpGroup>,
}

impl Default for SpMappingConfig {
    fn default() -> Self {
        SpMappingConfig {
            block_size: 100,
            leds_per_slot: 3,
            start_corner: StartCorner::Tl,
            row_direction_even: RowDirection::Lr,
            row_direction_odd: RowDirection::Rl,
            groups: default_sp_groups(),
        }
    }
}

/// One contiguous SP range with its own LED address block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpGroup {
    pub id: u32,
    pub start_sp: u32,
    pub end_sp: u32,
    pub cols_per_row: u32,
}

impl SpGroup {
    /// Whether `sp` falls inside this group's range.
    pub fn contains(&self, sp: u32) -> bool {
        self.start_sp <= sp && sp <= self.end_sp
    }
}

/// Corner the traversal starts from. TR/BR flip the horizontal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StartCorner {
    Tl,
    Tr,
    Bl,
    Br,
}

/// Horizontal traversal direction of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowDirection {
    Lr,
    Rl,
}

impl RowDirection {
    /// The opposite direction.
    pub fn flipped(self) -> RowDirection {
        match self {
            RowDirection::Lr => RowDirection::Rl,
            RowDirection::Rl => RowDirection::Lr,
        }
    }
}

fn default_sp_groups() -> Vec<SpGroup> {
    let table: [(u32, u32, u32, u32); 16] = [
        (1, 1, 70, 5),
        (2, 71, 151, 5),
        (3, 152, 210, 5),
        (4, 211, 280, 5),
        (5, 281, 350, 5),
        (6, 351, 420, 5),
        (7, 421, 490, 5),
        (8, 491, 610, 5),
        (9, 611, 670, 5),
        (10, 671, 730, 5),
        (11, 731, 790, 5),
        (12, 791, 850, 5),
        (13, 851, 910, 5),
        (14, 911, 950, 4),
        (15, 1001, 1034, 3),
        (16, 1051, 1099, 6),
    ];
    table
        .iter()
        .map(|&(id, start_sp, end_sp, cols_per_row)| SpGroup {
            id,
            start_sp,
            end_sp,
            cols_per_row,
        })
        .collect()
}

/// Per-item blink attribute policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub blink_enabled: bool,
    pub blink_threshold_percent: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            blink_enabled: true,
            blink_threshold_percent: 10.0,
        }
    }
}

/// Dispatcher overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Overrides `grouping.color_order` for payload composition.
    pub color_order: Option<Vec<Color>>,
}

/// Serial port candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub ports: Vec<String>,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            ports: Vec::new(),
            baud: 115_200,
        }
    }
}

/// Log sink locations. Levels are controlled by the subscriber filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
    /// Sink for raw non-protocol device output.
    pub device_info_file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: PathBuf::from("logs/app.log"),
            device_info_file: PathBuf::from("logs/device-info.log"),
        }
    }
}

/// Label printer stub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintingConfig {
    pub enabled: bool,
    pub columns: usize,
    pub column_separator: String,
}

impl Default for PrintingConfig {
    fn default() -> Self {
        PrintingConfig {
            enabled: false,
            columns: 2,
            column_separator: " | ".to_string(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    ///
    /// Resolution order: explicit `path`, then the [`CONFIG_ENV`] variable,
    /// then [`DEFAULT_CONFIG_PATH`]. A missing file is only tolerated for the
    /// fallback path, where the built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let (path, fallback) = match (path, env_path) {
            (Some(p), _) => (p.to_path_buf(), false),
            (None, Some(p)) => (p, false),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_PATH), true),
        };
        if fallback && !path.exists() {
            let cfg = Config::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        let text = fs::read_to_string(&path)?;
        let cfg: Config = serde_json::from_str(&text)
            .map_err(|e| LedlinkError::config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject inconsistent values before any component consumes them.
    pub fn validate(&self) -> Result<()> {
        regex::Regex::new(&self.parsing.row_pattern)
            .map_err(|e| LedlinkError::config(format!("parsing.row_pattern: {e}")))?;
        regex::Regex::new(&self.parsing.alt_row_pattern)
            .map_err(|e| LedlinkError::config(format!("parsing.alt_row_pattern: {e}")))?;
        regex::Regex::new(&self.grouping.name_tag_regex)
            .map_err(|e| LedlinkError::config(format!("grouping.name_tag_regex: {e}")))?;
        for group in &self.sp_mapping.groups {
            if group.start_sp > group.end_sp {
                return Err(LedlinkError::config(format!(
                    "sp_mapping.groups[{}]: start_sp {} > end_sp {}",
                    group.id, group.start_sp, group.end_sp
                )));
            }
            if group.cols_per_row < 1 {
                return Err(LedlinkError::config(format!(
                    "sp_mapping.groups[{}]: cols_per_row must be >= 1",
                    group.id
                )));
            }
        }
        if self.sp_mapping.leds_per_slot < 1 {
            return Err(LedlinkError::config("sp_mapping.leds_per_slot must be >= 1"));
        }
        if self.comm.retry.max_attempts < 1 {
            return Err(LedlinkError::config("comm.retry.max_attempts must be >= 1"));
        }
        if !(self.comm.heartbeat_interval_seconds > 0.0) {
            return Err(LedlinkError::config(
                "comm.heartbeat_interval_seconds must be > 0",
            ));
        }
        if self.grouping.color_order.len() != 3 {
            return Err(LedlinkError::config(
                "grouping.color_order must name all three channels",
            ));
        }
        if let Some(order) = &self.dispatcher.color_order {
            if order.len() != 3 {
                return Err(LedlinkError::config(
                    "dispatcher.color_order must name all three channels",
                ));
            }
        }
        Ok(())
    }

    /// Color order used for payload composition: the dispatcher override
    /// when present, the grouping order otherwise.
    pub fn effective_color_order(&self) -> Vec<Color> {
        self.dispatcher
            .color_order
            .clone()
            .unwrap_or_else(|| self.grouping.color_order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.comm.enable_heartbeat);
        assert_eq!(cfg.comm.bytes_per_frame, 512);
        assert_eq!(cfg.comm.retry.max_attempts, 3);
        assert_eq!(cfg.sp_mapping.block_size, 100);
        assert_eq!(cfg.sp_mapping.groups.len(), 16);
        assert_eq!(cfg.serial.baud, 115_200);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"comm": {"heartbeat_interval_seconds": 0.5, "retry": {"max_attempts": 5}}}"#,
        )
        .unwrap();
        assert!((cfg.comm.heartbeat_interval_seconds - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.comm.retry.max_attempts, 5);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.comm.retry.backoff_ms, 50);
        assert_eq!(cfg.grouping.work_dir, PathBuf::from("data/work"));
    }

    #[test]
    fn test_color_order_parses_letters() {
        let cfg: Config =
            serde_json::from_str(r#"{"grouping": {"color_order": ["B", "G", "R"]}}"#).unwrap();
        assert_eq!(
            cfg.grouping.color_order,
            vec![Color::B, Color::G, Color::R]
        );
    }

    #[test]
    fn test_dispatcher_order_overrides_grouping() {
        let cfg: Config =
            serde_json::from_str(r#"{"dispatcher": {"color_order": ["G", "R", "B"]}}"#).unwrap();
        assert_eq!(
            cfg.effective_color_order(),
            vec![Color::G, Color::R, Color::B]
        );
        let cfg = Config::default();
        assert_eq!(
            cfg.effective_color_order(),
            vec![Color::R, Color::G, Color::B]
        );
    }

    #[test]
    fn test_invalid_group_rejected_at_load() {
        let mut cfg = Config::default();
        cfg.sp_mapping.groups[0].start_sp = 100;
        cfg.sp_mapping.groups[0].end_sp = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("start_sp"));
    }

    #[test]
    fn test_invalid_regex_rejected_at_load() {
        let mut cfg = Config::default();
        cfg.parsing.row_pattern = "([unclosed".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_duplicate_ack_mode_is_parse_error() {
        let got: std::result::Result<Config, _> =
            serde_json::from_str(r#"{"comm": {"duplicate_ack_mode": "sometimes"}}"#);
        assert!(got.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"serial": {"ports": ["/dev/ttyUSB0"], "baud": 9600}}"#,
        )
        .unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.serial.ports, vec!["/dev/ttyUSB0".to_string()]);
        assert_eq!(cfg.serial.baud, 9600);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());
    }
}
