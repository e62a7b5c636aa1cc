//! Label printer stub.
//!
//! Disabled by default; when enabled it renders label batches into the log
//! in configured column groups. No driver dependency, so a real printer
//! adapter can replace it without touching callers.

use tracing::{debug, info};

use crate::config::PrintingConfig;

/// Columnar label output, log-backed.
pub struct Printer {
    enabled: bool,
    columns: usize,
    separator: String,
}

impl Printer {
    /// Build from the `printing` configuration section.
    pub fn new(cfg: &PrintingConfig) -> Printer {
        Printer {
            enabled: cfg.enabled,
            columns: cfg.columns.max(1),
            separator: cfg.column_separator.clone(),
        }
    }

    /// Emit `items` as rows of `columns` labels.
    pub fn print_labels(&self, items: &[String]) {
        if !self.enabled {
            debug!("printing disabled, skip {} labels", items.len());
            return;
        }
        info!("printing {} labels in {} columns", items.len(), self.columns);
        for row in items.chunks(self.columns) {
            info!("{}", row.join(&self.separator));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_printer_is_silent_noop() {
        let printer = Printer::new(&PrintingConfig::default());
        printer.print_labels(&["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_columns_floor_at_one() {
        let cfg = PrintingConfig {
            enabled: true,
            columns: 0,
            column_separator: " | ".to_string(),
        };
        let printer = Printer::new(&cfg);
        assert_eq!(printer.columns, 1);
    }
}
