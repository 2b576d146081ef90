//! Output processing for command results.
//!
//! Raw process output is captured up to a byte limit, stripped of ANSI
//! escape sequences and marked when truncated.
//!
//! # Example
//!
//! ```
//! use scope_broker::output::{CapturedOutput, OutputSanitizer};
//!
//! let raw = b"\x1b[31mRed text\x1b[0m";
//! assert_eq!(OutputSanitizer::strip_ansi(raw), "Red text");
//!
//! let sanitizer = OutputSanitizer::new(3);
//! let captured = CapturedOutput { bytes: b"abc".to_vec(), total: 5 };
//! assert!(sanitizer.render(&captured).ends_with("[output truncated: 2 bytes omitted]"));
//! ```

mod sanitizer;

pub use sanitizer::{CapturedOutput, OutputSanitizer, DEFAULT_MAX_OUTPUT_BYTES};
