use crate::domains::journal::{DynJournal, Journal};
use std::sync::Arc;
use tracing::warn;

/// Fans every entry out to a primary and an optional secondary journal.
pub struct MultiJournal {
    primary: DynJournal,
    secondary: Option<DynJournal>,
}

impl MultiJournal {
    pub fn new(primary: DynJournal, secondary: Option<DynJournal>) -> Self {
        Self { primary, secondary }
    }
}

impl Journal for MultiJournal {
    fn info(&self, msg: &str) {
        self.primary.info(msg);
        if let Some(sec) = &self.secondary {
            sec.info(msg);
        }
    }

    fn warn(&self, msg: &str) {
        self.primary.warn(msg);
        if let Some(sec) = &self.secondary {
            sec.warn(msg);
        }
    }

    fn error(&self, msg: &str) {
        self.primary.error(msg);
        if let Some(sec) = &self.secondary {
            sec.error(msg);
        }
    }

    fn result(&self, line: &str) {
        self.primary.result(line);
        if let Some(sec) = &self.secondary {
            sec.result(line);
        }
    }
}

/// File journal with an optional console echo. Falls back to the console
/// alone when the file cannot be opened.
pub fn init_combined_journal(path: &str, echo_console: bool) -> DynJournal {
    let console = super::init_console_journal();
    match super::init_file_journal(path) {
        Ok(file) => {
            let secondary = echo_console.then_some(console);
            Arc::new(MultiJournal::new(file, secondary))
        }
        Err(e) => {
            warn!(error = %e, path, "journal file unavailable, using console");
            console
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Journal for Recording {
        fn info(&self, msg: &str) {
            self.0.lock().push(format!("I {msg}"));
        }
        fn warn(&self, msg: &str) {
            self.0.lock().push(format!("W {msg}"));
        }
        fn error(&self, msg: &str) {
            self.0.lock().push(format!("E {msg}"));
        }
    }

    #[test]
    fn entries_reach_both_sinks() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let multi = MultiJournal::new(a.clone(), Some(b.clone() as DynJournal));
        multi.warn("slot 2 faulted");
        multi.result("M127 is prime!");

        let expected = vec!["W slot 2 faulted".to_string(), "I RESULT M127 is prime!".to_string()];
        assert_eq!(*a.0.lock(), expected);
        assert_eq!(*b.0.lock(), expected);
    }
}
