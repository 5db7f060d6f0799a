use std::sync::Arc;

/// Operator-facing journal port.
/// Kept small and infallible from the caller's side; sinks swallow their own errors.
pub trait Journal: Send + Sync + 'static {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);

    /// A finished computation, one line per result.
    fn result(&self, line: &str) {
        self.info(&format!("RESULT {line}"));
    }
}

pub type DynJournal = Arc<dyn Journal>;
