//! Output sanitization: ANSI stripping and size bounding.

use vte::{Params, Parser, Perform};

/// Default cap on captured bytes per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Bytes captured from one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// At most the sanitizer's limit.
    pub bytes: Vec<u8>,
    /// Bytes the stream produced in total.
    pub total: usize,
}

impl CapturedOutput {
    pub fn omitted(&self) -> usize {
        self.total.saturating_sub(self.bytes.len())
    }
}

/// Turns raw process output into clean, bounded text.
#[derive(Debug, Clone, Copy)]
pub struct OutputSanitizer {
    max_bytes: usize,
}

impl OutputSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Capture limit per stream.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Strip escape sequences and append a marker if output was cut short.
    pub fn render(&self, captured: &CapturedOutput) -> String {
        let mut text = Self::strip_ansi(&captured.bytes);
        let omitted = captured.omitted();
        if omitted > 0 {
            if !text.ends_with('\n') && !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated: {omitted} bytes omitted]"));
        }
        text
    }

    /// Strip ANSI escape codes from raw bytes.
    ///
    /// Returns UTF-8 text (lossy) with all control sequences removed.
    pub fn strip_ansi(input: &[u8]) -> String {
        let mut extractor = PlainTextExtractor::default();
        let mut parser = Parser::new();
        parser.advance(&mut extractor, input);
        String::from_utf8_lossy(&extractor.output).into_owned()
    }
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

/// VTE performer that keeps printable text and line structure.
#[derive(Default)]
struct PlainTextExtractor {
    output: Vec<u8>,
}

impl Perform for PlainTextExtractor {
    fn print(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.output
            .extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        // Newline, carriage return, tab.
        if matches!(byte, 0x0A | 0x0D | 0x09) {
            self.output.push(byte);
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(
        &mut self,
        _params: &Params,
        _intermediates: &[u8],
        _ignore: bool,
        _action: char,
    ) {
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}
