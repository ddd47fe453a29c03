//! Incremental splitting of a streamed change feed into JSON objects.
//!
//! The splitter never buffers more than the object currently being read:
//! completed objects are decoded and handed out as soon as their closing
//! brace arrives, regardless of how the byte stream is chunked.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// Framing of the objects in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Objects are elements of the first JSON array in the body
    /// (`{"results":[{...},{...}],"last_seq":..}`).
    ArrayElements,
    /// Objects follow each other separated by whitespace (continuous feed).
    Concatenated,
}

/// Streaming splitter yielding complete JSON objects.
#[derive(Debug)]
pub struct JsonObjectSplitter {
    mode: SplitMode,
    buf: Vec<u8>,
    scan: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    start: Option<usize>,
    array_opened: bool,
    finished: bool,
    at_line_start: bool,
    heartbeats: u64,
}

impl JsonObjectSplitter {
    /// Creates a splitter for the given framing.
    pub fn new(mode: SplitMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            scan: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            start: None,
            array_opened: mode == SplitMode::Concatenated,
            finished: false,
            at_line_start: true,
            heartbeats: 0,
        }
    }

    /// Returns true once the enclosing array has been closed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of empty lines seen between objects.
    ///
    /// A continuous feed sends an empty line as its heartbeat while no
    /// changes are pending.
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Feeds a chunk and returns every object completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> ProtocolResult<Vec<Map<String, Value>>> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(out);
        }
        self.buf.extend_from_slice(chunk);

        let mut i = self.scan;
        while i < self.buf.len() {
            let b = self.buf[i];

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                i += 1;
                continue;
            }

            if !self.array_opened {
                match b {
                    b'"' => self.in_string = true,
                    b'[' => self.array_opened = true,
                    _ => {}
                }
                i += 1;
                continue;
            }

            if self.depth == 0 {
                match b {
                    b'\n' => {
                        if self.at_line_start {
                            self.heartbeats += 1;
                        }
                        self.at_line_start = true;
                    }
                    b' ' | b'\t' | b'\r' | b',' => {}
                    b'{' => {
                        self.start = Some(i);
                        self.depth = 1;
                        self.at_line_start = false;
                    }
                    b']' if self.mode == SplitMode::ArrayElements => {
                        self.finished = true;
                        self.buf.clear();
                        self.scan = 0;
                        return Ok(out);
                    }
                    other => {
                        return Err(ProtocolError::UnexpectedJson(format!(
                            "expected an object in the change stream, found `{}`",
                            other as char
                        )))
                    }
                }
                i += 1;
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let start = self.start.take().unwrap_or(0);
                        let object: Map<String, Value> =
                            serde_json::from_slice(&self.buf[start..=i])?;
                        out.push(object);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        // Drop everything before the object in progress.
        let keep_from = self.start.unwrap_or(self.buf.len());
        self.buf.drain(..keep_from);
        if let Some(start) = self.start.as_mut() {
            *start = 0;
        }
        self.scan = self.buf.len();

        Ok(out)
    }

    /// Verifies the stream ended on a clean boundary.
    pub fn finish(&self) -> ProtocolResult<()> {
        if self.start.is_some() || self.in_string {
            return Err(ProtocolError::UnexpectedJson(
                "change stream ended inside an object".into(),
            ));
        }
        if self.mode == SplitMode::ArrayElements && !self.finished {
            return Err(ProtocolError::UnexpectedJson(
                "change array was not terminated".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(mode: SplitMode, chunks: &[&[u8]]) -> (Vec<Map<String, Value>>, JsonObjectSplitter) {
        let mut splitter = JsonObjectSplitter::new(mode);
        let mut all = Vec::new();
        for chunk in chunks {
            all.extend(splitter.push(chunk).unwrap());
        }
        (all, splitter)
    }

    #[test]
    fn array_body_in_one_chunk() {
        let body = br#"{"results":[{"seq":1,"id":"a"},{"seq":2,"id":"b"}],"last_seq":2}"#;
        let (objects, splitter) = split_all(SplitMode::ArrayElements, &[body]);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1]["id"], "b");
        assert!(splitter.is_finished());
        splitter.finish().unwrap();
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let body = br#"{"results":[{"seq":1,"id":"a}\"{","changes":[{"rev":"1-x"}]},{"seq":2}]}"#;
        let chunks: Vec<&[u8]> = body.chunks(3).collect();
        let (objects, splitter) = split_all(SplitMode::ArrayElements, &chunks);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["id"], "a}\"{");
        assert!(splitter.is_finished());
    }

    #[test]
    fn bracket_in_prefix_string_is_ignored() {
        let body = br#"{"note":"[not here","results":[{"seq":5}]}"#;
        let (objects, _) = split_all(SplitMode::ArrayElements, &[body]);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["seq"], 5);
    }

    #[test]
    fn empty_array_is_finished() {
        let (objects, splitter) = split_all(SplitMode::ArrayElements, &[br#"{"results":[],"last_seq":9}"#]);
        assert!(objects.is_empty());
        assert!(splitter.is_finished());
    }

    #[test]
    fn concatenated_stream_with_heartbeats() {
        let (objects, splitter) = split_all(
            SplitMode::Concatenated,
            &[b"{\"seq\":1}\n\n", b"{\"seq\"", b":2}\n", b"\n"],
        );
        assert_eq!(objects.len(), 2);
        assert_eq!(splitter.heartbeats(), 2);
        assert!(!splitter.is_finished());
        splitter.finish().unwrap();
    }

    #[test]
    fn heartbeat_before_any_change_is_counted() {
        let (objects, splitter) = split_all(SplitMode::Concatenated, &[b"\n"]);
        assert!(objects.is_empty());
        assert_eq!(splitter.heartbeats(), 1);
    }

    #[test]
    fn non_object_element_is_rejected() {
        let mut splitter = JsonObjectSplitter::new(SplitMode::ArrayElements);
        assert!(splitter.push(br#"{"results":[1,2]}"#).is_err());
    }

    #[test]
    fn truncated_stream_fails_finish() {
        let (_, splitter) = split_all(SplitMode::ArrayElements, &[br#"{"results":[{"seq":1"#]);
        assert!(splitter.finish().is_err());
    }
}
