use crate::domains::journal::{DynJournal, Journal};
use std::sync::Arc;

struct NoOp;

impl Journal for NoOp {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn result(&self, _line: &str) {}
}

pub fn init_noop_journal() -> DynJournal {
    Arc::new(NoOp)
}
