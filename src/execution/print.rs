//! Accumulates script print emissions into lines.

use super::format::format_value;
use crate::progress::PrintEmission;

/// Line-oriented print buffer for one run.
///
/// Complete lines move into [`PrintCapture::lines`] as soon as their newline
/// arrives; a trailing partial line stays buffered until
/// [`PrintCapture::flush_trailing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrintCapture {
    buffer: String,
    lines: Vec<String>,
}

impl PrintCapture {
    /// Empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture that continues after lines recorded earlier.
    pub fn seeded(lines: Vec<String>) -> Self {
        Self {
            buffer: String::new(),
            lines,
        }
    }

    /// Render one emission and move any completed lines out of the buffer.
    pub fn append(&mut self, emission: &PrintEmission) {
        let rendered = emission
            .values
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(" ");
        self.buffer.push_str(&rendered);
        self.buffer.push_str(&emission.end);
        self.flush_complete();
    }

    /// Append every emission in order.
    pub fn extend<'a>(&mut self, emissions: impl IntoIterator<Item = &'a PrintEmission>) {
        for emission in emissions {
            self.append(emission);
        }
    }

    /// Move the trailing partial line, if any, into the line list.
    pub fn flush_trailing(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.lines.push(trim_cr(&line).to_string());
        }
    }

    /// Completed lines so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn flush_complete(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(pos + 1);
            let line = std::mem::replace(&mut self.buffer, rest);
            self.lines.push(trim_cr(&line[..pos]).to_string());
        }
    }
}

fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}
