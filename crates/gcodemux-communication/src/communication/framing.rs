//! Line framing for the serial reader
//!
//! The firmware emits `\r\n`-terminated lines in arbitrary chunks. The
//! framer buffers bytes until a `\n` arrives and strips the trailing `\r`.

/// Longest line kept before the buffer is flushed as a line anyway
const MAX_LINE_BYTES: usize = 4096;

/// Buffers input and emits a line whenever a newline is encountered
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Feed a chunk and collect every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            if b == b'\n' {
                lines.push(self.take_line());
            } else {
                self.buffer.push(b);
                if self.buffer.len() >= MAX_LINE_BYTES {
                    tracing::warn!("No newline after {} bytes, flushing line", MAX_LINE_BYTES);
                    lines.push(self.take_line());
                }
            }
        }

        lines
    }

    /// Bytes of the incomplete line currently buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn take_line(&mut self) -> String {
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_simple() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"ok\r\n<Idle|MPos:0.000,0.000,0.000>\r\n");
        assert_eq!(lines, vec!["ok", "<Idle|MPos:0.000,0.000,0.000>"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_lines_split() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"err").is_empty());
        assert_eq!(framer.pending(), 3);
        assert_eq!(framer.push(b"or:9\r"), Vec::<String>::new());
        assert_eq!(framer.push(b"\nok"), vec!["error:9"]);
        framer.reset();
        assert_eq!(framer.push(b"\n"), vec![""]);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut framer = LineFramer::new();
        let lines = framer.push(&[0xff, b'o', b'k', b'\n']);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("ok"));
    }
}
