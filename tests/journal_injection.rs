use primenet_client::adapters::outbound::{init_buffered_journal, init_noop_journal, MultiJournal};
use primenet_client::domains::journal::{DynJournal, Journal};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Capture {
    messages: Arc<Mutex<Vec<String>>>,
}

impl Capture {
    fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Journal for Capture {
    fn info(&self, msg: &str) {
        self.messages.lock().unwrap().push(format!("INFO:{}", msg));
    }
    fn warn(&self, msg: &str) {
        self.messages.lock().unwrap().push(format!("WARN:{}", msg));
    }
    fn error(&self, msg: &str) {
        self.messages.lock().unwrap().push(format!("ERR:{}", msg));
    }
}

#[tokio::test]
async fn test_buffered_and_noop_journal() {
    let capture = Arc::new(Capture::new());
    let sink = capture.clone() as DynJournal;

    let buffered = init_buffered_journal(sink, 8);
    buffered.info("one");
    buffered.warn("two");
    buffered.error("three");
    buffered.result("M127 is prime");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let msgs = capture.messages.lock().unwrap();
    assert!(msgs.iter().any(|m| m == "INFO:one"));
    assert!(msgs.iter().any(|m| m == "WARN:two"));
    assert!(msgs.iter().any(|m| m == "ERR:three"));
    assert!(msgs.iter().any(|m| m == "INFO:RESULT M127 is prime"));

    let noop = init_noop_journal();
    noop.info("ignored");
    noop.result("ignored");
}

#[test]
fn test_multi_journal_fans_out() {
    let primary = Arc::new(Capture::new());
    let secondary = Arc::new(Capture::new());
    let multi = MultiJournal::new(primary.clone(), Some(secondary.clone() as DynJournal));

    multi.warn("slot 2 faulted");

    assert_eq!(*primary.messages.lock().unwrap(), vec!["WARN:slot 2 faulted"]);
    assert_eq!(*secondary.messages.lock().unwrap(), vec!["WARN:slot 2 faulted"]);
}
