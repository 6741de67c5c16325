/// Scoped output capture
///
/// A `ScopedCapture` routes everything written through its `Console` into the
/// log store under one execution key. Lines are committed as soon as their
/// newline arrives; whatever is left over is flushed when the scope (and the
/// last console handle) goes away, including during panic unwinding.

use crate::logs::store::{ExecutionKey, LogStore};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

const ERROR_PREFIX: &str = "[ERROR] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Live capture scope for one run
pub struct ScopedCapture {
    store: Arc<LogStore>,
    key: ExecutionKey,
    console: Console,
}

impl ScopedCapture {
    pub(crate) fn new(store: Arc<LogStore>, key: ExecutionKey) -> Self {
        let console = Console {
            inner: Arc::new(ConsoleInner {
                store: Arc::clone(&store),
                key: key.clone(),
                stdout: Mutex::new(Vec::new()),
                stderr: Mutex::new(Vec::new()),
            }),
        };

        Self { store, key, console }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    /// Inject a synthetic line such as `START RequestId: ...`
    pub fn add_line(&self, message: impl AsRef<str>) {
        if let Some(line) = normalize(message.as_ref(), Stream::Stdout) {
            self.store.append(&self.key, line);
        }
    }

    /// Record a failure line, tagged like stderr output
    pub fn add_error(&self, message: impl AsRef<str>) {
        let lines: Vec<String> = message
            .as_ref()
            .lines()
            .filter_map(|line| normalize(line, Stream::Stderr))
            .collect();
        self.store.append_lines(&self.key, lines);
    }

    /// Handle given to program code so its output lands in this scope
    pub fn console(&self) -> Console {
        self.console.clone()
    }
}

impl Drop for ScopedCapture {
    fn drop(&mut self) {
        self.console.inner.flush_partial();
    }
}

/// Cloneable stdout/stderr pair bound to one capture scope
#[derive(Clone)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

impl Console {
    pub fn println(&self, message: impl AsRef<str>) {
        self.inner.write(Stream::Stdout, message.as_ref().as_bytes());
        self.inner.write(Stream::Stdout, b"\n");
    }

    pub fn eprintln(&self, message: impl AsRef<str>) {
        self.inner.write(Stream::Stderr, message.as_ref().as_bytes());
        self.inner.write(Stream::Stderr, b"\n");
    }

    pub fn stdout(&self) -> ConsoleWriter {
        ConsoleWriter {
            inner: Arc::clone(&self.inner),
            stream: Stream::Stdout,
        }
    }

    pub fn stderr(&self) -> ConsoleWriter {
        ConsoleWriter {
            inner: Arc::clone(&self.inner),
            stream: Stream::Stderr,
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.inner.key
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").field("key", &self.inner.key).finish()
    }
}

/// `io::Write` adapter for one of the console streams
pub struct ConsoleWriter {
    inner: Arc<ConsoleInner>,
    stream: Stream,
}

impl io::Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(self.stream, buf);
        Ok(buf.len())
    }

    // Partial lines stay pending until their newline or the end of the scope.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ConsoleInner {
    store: Arc<LogStore>,
    key: ExecutionKey,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl ConsoleInner {
    fn buffer(&self, stream: Stream) -> &Mutex<Vec<u8>> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    fn write(&self, stream: Stream, bytes: &[u8]) {
        let complete = {
            let mut pending = self.buffer(stream).lock().unwrap_or_else(PoisonError::into_inner);
            pending.extend_from_slice(bytes);

            match pending.iter().rposition(|b| *b == b'\n') {
                Some(last_newline) => {
                    let rest = pending.split_off(last_newline + 1);
                    std::mem::replace(&mut *pending, rest)
                }
                None => return,
            }
        };

        let lines = split_lines(&complete, stream);
        self.store.append_lines(&self.key, lines);
    }

    fn flush_partial(&self) {
        for stream in [Stream::Stdout, Stream::Stderr] {
            let leftover = {
                let mut pending = self.buffer(stream).lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *pending)
            };
            if !leftover.is_empty() {
                self.store.append_lines(&self.key, split_lines(&leftover, stream));
            }
        }
    }
}

impl Drop for ConsoleInner {
    fn drop(&mut self) {
        self.flush_partial();
    }
}

fn split_lines(bytes: &[u8], stream: Stream) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\n')
        .filter_map(|line| normalize(line, stream))
        .collect()
}

/// Trim a raw line, drop it when blank and tag stderr output
fn normalize(line: &str, stream: Stream) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match stream {
        Stream::Stderr if !trimmed.starts_with('[') => Some(format!("{}{}", ERROR_PREFIX, trimmed)),
        _ => Some(trimmed.to_string()),
    }
}
