//! Where rendered text goes: the caller's writer, or the innermost open capture.

use std::fmt;

use crate::error::{Error, JinjateResult};

pub(crate) struct Output<'a> {
    sink: &'a mut (dyn fmt::Write + 'a),
    captures: Vec<String>,
}

impl<'a> Output<'a> {
    pub(crate) fn new(sink: &'a mut (dyn fmt::Write + 'a)) -> Self {
        Self {
            sink,
            captures: Vec::new(),
        }
    }

    pub(crate) fn write_str(&mut self, s: &str) -> JinjateResult<()> {
        match self.captures.last_mut() {
            Some(capture) => {
                capture.push_str(s);
                Ok(())
            }
            None => self
                .sink
                .write_str(s)
                .map_err(|_| Error::runtime("failed to write template output")),
        }
    }

    pub(crate) fn begin_capture(&mut self) {
        self.captures.push(String::new());
    }

    pub(crate) fn end_capture(&mut self) -> String {
        self.captures.pop().unwrap_or_default()
    }

    pub(crate) fn capture_depth(&self) -> usize {
        self.captures.len()
    }

    /// Drops captures opened after `depth`, used when unwinding after an error.
    pub(crate) fn truncate_captures(&mut self, depth: usize) {
        self.captures.truncate(depth);
    }
}

/// Collects every write as its own chunk, for streaming renders.
#[derive(Debug, Default)]
pub(crate) struct ChunkCollector {
    pub chunks: Vec<String>,
}

impl fmt::Write for ChunkCollector {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if !s.is_empty() {
            self.chunks.push(s.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_captures_nest() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        out.write_str("a").unwrap();
        out.begin_capture();
        out.write_str("b").unwrap();
        out.begin_capture();
        out.write_str("c").unwrap();
        assert_eq!(out.end_capture(), "c");
        assert_eq!(out.end_capture(), "b");
        out.write_str("d").unwrap();
        assert_eq!(out.capture_depth(), 0);
        assert_eq!(buf, "ad");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_chunk_collector_skips_empty_writes() {
        let mut collector = ChunkCollector::default();
        {
            let mut out = Output::new(&mut collector);
            out.write_str("x").unwrap();
            out.write_str("").unwrap();
            out.write_str("y").unwrap();
        }
        assert_eq!(collector.chunks, vec!["x".to_string(), "y".to_string()]);
    }
}
