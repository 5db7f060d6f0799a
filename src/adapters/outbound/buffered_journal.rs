use crate::domains::journal::{DynJournal, Journal};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Level {
    Info,
    Warn,
    Error,
    Result,
}

struct Entry {
    level: Level,
    msg: String,
}

struct BufferedJournal {
    sender: mpsc::Sender<Entry>,
}

impl BufferedJournal {
    // Never blocks the control loop; entries are dropped when the buffer is full.
    fn push(&self, level: Level, msg: &str) {
        let _ = self.sender.try_send(Entry {
            level,
            msg: msg.to_string(),
        });
    }
}

impl Journal for BufferedJournal {
    fn info(&self, msg: &str) {
        self.push(Level::Info, msg);
    }
    fn warn(&self, msg: &str) {
        self.push(Level::Warn, msg);
    }
    fn error(&self, msg: &str) {
        self.push(Level::Error, msg);
    }
    fn result(&self, line: &str) {
        self.push(Level::Result, line);
    }
}

/// Non-blocking journal. Entries are forwarded to `sink` from a background
/// task; `capacity` bounds the channel. Must be called inside a tokio runtime.
pub fn init_buffered_journal(sink: DynJournal, capacity: usize) -> DynJournal {
    let (tx, mut rx) = mpsc::channel::<Entry>(capacity.max(1));
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            match entry.level {
                Level::Info => sink.info(&entry.msg),
                Level::Warn => sink.warn(&entry.msg),
                Level::Error => sink.error(&entry.msg),
                Level::Result => sink.result(&entry.msg),
            }
        }
    });
    Arc::new(BufferedJournal { sender: tx })
}
