use crate::domains::journal::{DynJournal, Journal};
use chrono::Local;
use std::sync::Arc;

struct ConsoleJournal;

impl ConsoleJournal {
    fn stamp() -> String {
        Local::now().format("[%b %d %H:%M]").to_string()
    }
}

impl Journal for ConsoleJournal {
    fn info(&self, msg: &str) {
        println!("{} {}", Self::stamp(), msg);
    }
    fn warn(&self, msg: &str) {
        println!("{} WARN: {}", Self::stamp(), msg);
    }
    fn error(&self, msg: &str) {
        eprintln!("{} ERROR: {}", Self::stamp(), msg);
    }
    fn result(&self, line: &str) {
        println!("{} {}", Self::stamp(), line);
    }
}

/// Journal on stdout/stderr. Used when no journal file is configured or it cannot be opened.
pub fn init_console_journal() -> DynJournal {
    Arc::new(ConsoleJournal)
}
