//! Worktodo file: locally supplied assignments for manual mode.
//!
//! One assignment per line, `#` or `;` starts a comment:
//!
//! ```text
//! Test=[AID,]exponent
//! PRP=[AID,]1,2,exponent,-1
//! Pfactor=[AID,]1,2,exponent,-1,b1,b2
//! ECM2=[AID,]1,2,exponent,-1,b1,b2,curves
//! ```
//!
//! Drawn lines are removed from the file. Malformed lines stay where they are
//! and are logged with their line number.

use crate::domains::primenet::ManualWorkSource;
use crate::domains::work_queue::{Assignment, AssignmentId, AssignmentSource, Priority, WorkKind};
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// PRP lines carry no base; the usual Fermat base is used.
pub const DEFAULT_PRP_BASE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("worktodo line {line}: {message}")]
pub struct WorktodoError {
    pub line: usize,
    pub message: String,
}

/// Parse one line. `Ok(None)` for blanks and comments.
pub fn parse_line(text: &str) -> Result<Option<Assignment>, String> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with(';') {
        return Ok(None);
    }
    let (key, rest) = text
        .split_once('=')
        .ok_or_else(|| "expected <Type>=<fields>".to_string())?;
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();

    let arity = match key.trim() {
        "Test" => 1,
        "PRP" => 4,
        "Pfactor" => 6,
        "ECM2" => 7,
        other => return Err(format!("unknown work type {other:?}")),
    };
    let (aid, args) = if fields.len() == arity + 1 {
        (Some(fields[0]), &fields[1..])
    } else if fields.len() == arity {
        (None, &fields[..])
    } else {
        return Err(format!(
            "{} expects {} fields (plus optional AID), found {}",
            key.trim(),
            arity,
            fields.len()
        ));
    };

    let kind = match key.trim() {
        "Test" => WorkKind::LucasLehmer {
            exponent: number(args[0], "exponent")?,
        },
        "PRP" => WorkKind::Prp {
            base: DEFAULT_PRP_BASE,
            exponent: mersenne(args)?,
        },
        "Pfactor" => {
            let (b1, b2) = bounds(args[4], args[5])?;
            WorkKind::PMinus1 {
                exponent: mersenne(args)?,
                b1,
                b2,
            }
        }
        _ => {
            let (b1, b2) = bounds(args[4], args[5])?;
            let curves = number(args[6], "curves")?;
            WorkKind::Ecm {
                exponent: mersenne(args)?,
                b1,
                b2,
                curves: u32::try_from(curves).map_err(|_| format!("curves out of range: {curves}"))?,
            }
        }
    };

    let id = match aid {
        Some(aid) if !aid.is_empty() && !aid.eq_ignore_ascii_case("N/A") => AssignmentId::new(aid),
        _ => AssignmentId::generate(),
    };
    Ok(Some(Assignment::new(
        id,
        kind,
        Priority::Normal,
        AssignmentSource::Manual,
    )))
}

fn number(field: &str, what: &str) -> Result<u64, String> {
    field
        .parse::<u64>()
        .map_err(|_| format!("{what} is not a number: {field:?}"))
}

/// `k,b,n,c` must describe 2^n - 1.
fn mersenne(args: &[&str]) -> Result<u64, String> {
    if args[0] != "1" || args[1] != "2" || args[3] != "-1" {
        return Err(format!(
            "only Mersenne numbers (1,2,n,-1) are supported, got {},{},{},{}",
            args[0], args[1], args[2], args[3]
        ));
    }
    number(args[2], "exponent")
}

fn bounds(b1: &str, b2: &str) -> Result<(u64, u64), String> {
    let b1 = number(b1, "B1")?;
    let b2 = number(b2, "B2")?;
    if b2 != 0 && b2 < b1 {
        return Err(format!("B2 ({b2}) below B1 ({b1})"));
    }
    Ok((b1, b2.max(b1)))
}

/// Parse a whole file. Good lines come back with their 1-based line numbers.
pub fn parse_worktodo(text: &str) -> (Vec<(usize, Assignment)>, Vec<WorktodoError>) {
    let mut parsed = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(assignment)) => parsed.push((idx + 1, assignment)),
            Ok(None) => {}
            Err(message) => errors.push(WorktodoError { line: idx + 1, message }),
        }
    }
    (parsed, errors)
}

pub struct WorktodoFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl WorktodoFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self, lines: &[&str]) -> std::io::Result<()> {
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

impl ManualWorkSource for WorktodoFile {
    fn draw(&self, max: usize) -> Result<Vec<Assignment>, String> {
        let _guard = self.lock.lock();
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("failed to read {}: {}", self.path.display(), e)),
        };

        let (parsed, errors) = parse_worktodo(&text);
        for error in &errors {
            warn!("{} ({})", error, self.path.display());
        }

        let drawn: Vec<(usize, Assignment)> = parsed.into_iter().take(max).collect();
        if drawn.is_empty() {
            return Ok(Vec::new());
        }

        let consumed: Vec<usize> = drawn.iter().map(|(line, _)| *line).collect();
        let remaining: Vec<&str> = text
            .lines()
            .enumerate()
            .filter(|(idx, _)| !consumed.contains(&(idx + 1)))
            .map(|(_, line)| line)
            .collect();
        self.rewrite(&remaining)
            .map_err(|e| format!("failed to rewrite {}: {}", self.path.display(), e))?;

        info!("Drew {} assignments from {}", drawn.len(), self.path.display());
        Ok(drawn.into_iter().map(|(_, a)| a).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_every_work_type() {
        let text = "\
# comment
Test=0123456789ABCDEF0123456789ABCDEF,110503
PRP=1,2,132049,-1
; another comment

Pfactor=N/A,1,2,216091,-1,1000000,30000000
ECM2=1,2,756839,-1,50000,5000000,10
";
        let (parsed, errors) = parse_worktodo(text);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(parsed.len(), 4);

        assert_eq!(parsed[0].0, 2);
        assert_eq!(parsed[0].1.id.as_str(), "0123456789ABCDEF0123456789ABCDEF");
        assert_eq!(parsed[0].1.kind, WorkKind::LucasLehmer { exponent: 110503 });
        assert_eq!(
            parsed[1].1.kind,
            WorkKind::Prp {
                base: DEFAULT_PRP_BASE,
                exponent: 132049
            }
        );
        assert_eq!(
            parsed[2].1.kind,
            WorkKind::PMinus1 {
                exponent: 216091,
                b1: 1_000_000,
                b2: 30_000_000
            }
        );
        assert_ne!(parsed[2].1.id.as_str(), "N/A");
        assert_eq!(
            parsed[3].1.kind,
            WorkKind::Ecm {
                exponent: 756839,
                b1: 50_000,
                b2: 5_000_000,
                curves: 10
            }
        );
        assert!(parsed.iter().all(|(_, a)| a.source == AssignmentSource::Manual));
    }

    #[test]
    fn malformed_lines_reported_with_line_numbers() {
        let text = "Test=abc\nFoo=1\nPRP=1,2,127,+1\nTest=127\nPfactor=1,2,127,-1,500,100\n";
        let (parsed, errors) = parse_worktodo(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, 4);
        let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2, 3, 5]);
        assert!(errors[2].to_string().starts_with("worktodo line 3:"));
    }

    #[test]
    fn draw_consumes_lines_and_keeps_the_rest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worktodo.txt");
        fs::write(&path, "Test=A1,127\nbroken line\nTest=A2,521\nTest=A3,607\n").unwrap();

        let source = WorktodoFile::new(&path);
        let first = source.draw(2).unwrap();
        let ids: Vec<&str> = first.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "A2"]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "broken line\nTest=A3,607\n");

        let second = source.draw(5).unwrap();
        assert_eq!(second.len(), 1);
        assert!(source.draw(5).unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "broken line\n");
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let source = WorktodoFile::new(dir.path().join("absent.txt"));
        assert!(source.draw(3).unwrap().is_empty());
    }
}
