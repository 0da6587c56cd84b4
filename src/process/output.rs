use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Lines kept while nobody is listening.
pub const DEFAULT_OUTPUT_LINES: usize = 2_000;

/// Ring buffer of recent output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            lines: VecDeque::with_capacity(max_lines.min(256)),
            max_lines,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted since the buffer was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct OutputState {
    buffer: OutputBuffer,
    listener: Option<mpsc::UnboundedSender<String>>,
}

/// Routes captured lines to the attached listener, or buffers them when there is none.
pub struct OutputChannel {
    state: Mutex<OutputState>,
}

impl OutputChannel {
    pub fn new(max_lines: usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                buffer: OutputBuffer::with_capacity(max_lines),
                listener: None,
            }),
        }
    }

    /// Attach a listener, replacing any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listener = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.lock().listener = None;
    }

    pub fn push(&self, line: String) {
        let mut state = self.lock();
        let line = match state.listener.as_ref() {
            Some(tx) => match tx.send(line) {
                Ok(()) => return,
                Err(mpsc::error::SendError(line)) => line,
            },
            None => line,
        };
        state.listener = None;
        state.buffer.push(line);
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.lock().buffer.drain()
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
