//! Streaming MIME multipart tokenizer.
//!
//! Bytes can be appended in chunks of any size; part boundaries are detected
//! across chunk splits and part bodies are forwarded to a [`PartHandler`]
//! incrementally, so attachment payloads never have to be buffered whole.

use crate::error::{ProtocolError, ProtocolResult};
use std::collections::BTreeMap;

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Receives the parts of a multipart body as they are tokenized.
pub trait PartHandler {
    /// Error type produced by the handler.
    type Error: From<ProtocolError>;

    /// A new part starts with the given headers.
    fn started_part(&mut self, headers: &PartHeaders) -> Result<(), Self::Error>;

    /// Body bytes of the current part.
    fn part_data(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// The current part is complete.
    fn finished_part(&mut self) -> Result<(), Self::Error>;
}

/// Headers of one MIME part, with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    headers: BTreeMap<String, String>,
}

impl PartHeaders {
    /// Looks up a header by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns true if the part had no headers.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let headers = text
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
            .collect();
        Self { headers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterBoundary,
    Headers,
    Body,
    Epilogue,
}

/// Incremental multipart tokenizer bound to one boundary string.
#[derive(Debug)]
pub struct MultipartTokenizer {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    state: State,
}

impl MultipartTokenizer {
    /// Creates a tokenizer for the boundary declared in `content_type`.
    pub fn from_content_type(content_type: &str) -> ProtocolResult<Self> {
        Ok(Self::new(&boundary_of(content_type)?))
    }

    /// Creates a tokenizer for an explicit boundary.
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            // The first boundary may start the body without a leading CRLF.
            buf: b"\r\n".to_vec(),
            state: State::Preamble,
        }
    }

    /// Returns true once the closing boundary has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::Epilogue
    }

    /// Appends bytes, forwarding every completed token to `handler`.
    pub fn append<H: PartHandler>(&mut self, data: &[u8], handler: &mut H) -> Result<(), H::Error> {
        if self.state == State::Epilogue {
            return Ok(());
        }
        self.buf.extend_from_slice(data);

        loop {
            match self.state {
                State::Preamble => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        self.keep_tail();
                        return Ok(());
                    }
                },
                State::AfterBoundary => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if self.buf.starts_with(b"--") {
                        self.state = State::Epilogue;
                        self.buf.clear();
                        return Ok(());
                    }
                    match find(&self.buf, b"\r\n") {
                        Some(pos) => {
                            // Anything between the boundary and CRLF is transport padding.
                            self.buf.drain(..pos + 2);
                            self.state = State::Headers;
                        }
                        None if self.buf.len() > MAX_HEADER_BYTES => {
                            return Err(ProtocolError::Multipart(
                                "boundary line is not terminated".into(),
                            )
                            .into())
                        }
                        None => return Ok(()),
                    }
                }
                State::Headers => {
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        handler.started_part(&PartHeaders::default())?;
                        self.state = State::Body;
                        continue;
                    }
                    match find(&self.buf, b"\r\n\r\n") {
                        Some(pos) => {
                            let headers = PartHeaders::parse(&self.buf[..pos]);
                            self.buf.drain(..pos + 4);
                            handler.started_part(&headers)?;
                            self.state = State::Body;
                        }
                        None if self.buf.len() > MAX_HEADER_BYTES => {
                            return Err(ProtocolError::Multipart("part headers too large".into()).into())
                        }
                        None => return Ok(()),
                    }
                }
                State::Body => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            handler.part_data(&self.buf[..pos])?;
                        }
                        handler.finished_part()?;
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        // Hold back bytes that could be the start of a delimiter.
                        let safe = self.buf.len().saturating_sub(self.delimiter.len() - 1);
                        if safe > 0 {
                            handler.part_data(&self.buf[..safe])?;
                            self.buf.drain(..safe);
                        }
                        return Ok(());
                    }
                },
                State::Epilogue => return Ok(()),
            }
        }
    }

    fn keep_tail(&mut self) {
        let keep = self.delimiter.len() - 1;
        if self.buf.len() > keep {
            let cut = self.buf.len() - keep;
            self.buf.drain(..cut);
        }
    }
}

/// Extracts the `boundary` parameter of a `multipart/*` content type.
pub fn boundary_of(content_type: &str) -> ProtocolResult<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_owned())
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(|| ProtocolError::UnsupportedContentType(content_type.to_owned()))
}

/// Extracts the filename from a `Content-Disposition: attachment` header.
pub fn disposition_filename(disposition: &str) -> Option<String> {
    let mut params = disposition.split(';');
    let kind = params.next()?.trim();
    if !kind.eq_ignore_ascii_case("attachment") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("filename"))
        .map(|(_, value)| value.trim().replace('"', ""))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
