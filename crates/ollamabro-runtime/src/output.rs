use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Last lines printed by the current llama-server process. Shown in status
/// responses and attached to startup failures.
#[derive(Debug)]
pub struct OutputTail {
    capacity: usize,
    lines: Mutex<VecDeque<OutputLine>>,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, stream: OutputStream, text: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(OutputLine { stream, text });
    }

    /// Forget the previous process's output.
    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn tail(&self, last_n: usize) -> Vec<OutputLine> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(last_n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn tail_text(&self, last_n: usize) -> String {
        self.tail(last_n)
            .iter()
            .map(|line| format!("[{}] {}", line.stream.as_str(), line.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
