use crate::domains::journal::{DynJournal, Journal};
use std::sync::Arc;

const RESULTS_TARGET: &str = "results";

/// Forwards to the `log` facade, which fast_log writes to the journal file.
struct FileJournal;

impl Journal for FileJournal {
    fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }

    fn result(&self, line: &str) {
        log::info!(target: RESULTS_TARGET, "{}", line);
    }
}

/// Install fast_log as the process `log` backend writing to `path`.
/// Can only succeed once per process.
pub fn init_file_journal(path: &str) -> Result<DynJournal, String> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create journal directory: {}", e))?;
        }
    }
    fast_log::init(fast_log::config::Config::new().file(path).level(log::LevelFilter::Info))
        .map_err(|e| format!("Failed to initialize fast_log: {}", e))?;
    Ok(Arc::new(FileJournal))
}
