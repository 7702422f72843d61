use log::warn;

use crate::{
    error::SourceError,
    ota::{FlashUpdate, OtaOutcome, OtaSession},
};

const MAX_PART_HEADER_BYTES: usize = 1_024;

/// Pull-based request body. `Ok(0)` marks the end of the body.
pub trait ChunkSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    Preamble,
    Headers,
    FileBody,
    SkipBody,
    Done,
}

/// Incremental `multipart/form-data` decoder that forwards the bytes of the
/// first file part and ignores everything else. Only a delimiter-sized tail
/// is ever held back.
#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    state: PartState,
    pending: Vec<u8>,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            state: PartState::Preamble,
            // Lets the opening boundary match the same CRLF-prefixed delimiter.
            pending: b"\r\n".to_vec(),
        }
    }

    pub fn feed(&mut self, input: &[u8], sink: &mut dyn FnMut(&[u8])) {
        if self.state == PartState::Done {
            return;
        }
        self.pending.extend_from_slice(input);

        loop {
            match self.state {
                PartState::Preamble | PartState::SkipBody => {
                    match find(&self.pending, &self.delimiter) {
                        Some(at) => {
                            self.pending.drain(..at + self.delimiter.len());
                            self.state = PartState::Headers;
                        }
                        None => {
                            self.keep_tail();
                            return;
                        }
                    }
                }
                PartState::Headers => {
                    if self.pending.len() < 2 {
                        return;
                    }
                    if self.pending.starts_with(b"--") {
                        self.close();
                        return;
                    }
                    match find(&self.pending, b"\r\n\r\n") {
                        Some(at) => {
                            let is_file = has_filename(&self.pending[..at]);
                            self.pending.drain(..at + 4);
                            self.state = if is_file {
                                PartState::FileBody
                            } else {
                                PartState::SkipBody
                            };
                        }
                        None => {
                            if self.pending.len() > MAX_PART_HEADER_BYTES {
                                warn!("upload: multipart part headers too long, ignoring body");
                                self.close();
                            }
                            return;
                        }
                    }
                }
                PartState::FileBody => match find(&self.pending, &self.delimiter) {
                    Some(at) => {
                        sink(&self.pending[..at]);
                        self.close();
                        return;
                    }
                    None => {
                        let safe = self
                            .pending
                            .len()
                            .saturating_sub(self.delimiter.len() - 1);
                        if safe > 0 {
                            sink(&self.pending[..safe]);
                            self.pending.drain(..safe);
                        }
                        return;
                    }
                },
                PartState::Done => return,
            }
        }
    }

    /// The body ended while file bytes were still flowing.
    pub fn truncated(&self) -> bool {
        self.state == PartState::FileBody
    }

    fn keep_tail(&mut self) {
        let excess = self
            .pending
            .len()
            .saturating_sub(self.delimiter.len() - 1);
        self.pending.drain(..excess);
    }

    fn close(&mut self) {
        self.state = PartState::Done;
        self.pending.clear();
    }
}

#[derive(Debug)]
pub enum BodyDecoder {
    Raw,
    Multipart(MultipartDecoder),
}

impl BodyDecoder {
    /// Multipart when the content type carries a boundary, raw bytes otherwise.
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        match content_type.and_then(multipart_boundary) {
            Some(boundary) => Self::Multipart(MultipartDecoder::new(&boundary)),
            None => Self::Raw,
        }
    }

    pub fn feed(&mut self, input: &[u8], sink: &mut dyn FnMut(&[u8])) {
        match self {
            Self::Raw => sink(input),
            Self::Multipart(decoder) => decoder.feed(input, sink),
        }
    }

    pub fn truncated(&self) -> bool {
        match self {
            Self::Raw => false,
            Self::Multipart(decoder) => decoder.truncated(),
        }
    }
}

/// Drains `source` into the session and returns the outcome. The session is
/// back at `Idle` afterwards, ready for the next exchange.
pub fn stream_upload<F: FlashUpdate>(
    session: &mut OtaSession<F>,
    source: &mut dyn ChunkSource,
    content_type: Option<&str>,
    chunk_size: usize,
) -> OtaOutcome {
    let mut decoder = BodyDecoder::for_content_type(content_type);
    let mut buf = vec![0_u8; chunk_size.max(1)];

    loop {
        match source.read_chunk(&mut buf) {
            Ok(0) => {
                if decoder.truncated() {
                    warn!("upload: body ended inside the file part");
                    session.disconnect();
                }
                break;
            }
            Ok(read) => decoder.feed(&buf[..read], &mut |bytes: &[u8]| session.write(bytes)),
            Err(err) => {
                warn!("upload: {err}");
                session.disconnect();
                break;
            }
        }
    }

    let outcome = session.finish();
    session.reset();
    outcome
}

pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    params.find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn has_filename(headers: &[u8]) -> bool {
    String::from_utf8_lossy(headers)
        .to_ascii_lowercase()
        .contains("filename=")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// In-memory body, for bindings that already buffered the request.
pub struct SliceSource<'a> {
    data: &'a [u8],
    chunk: usize,
    fail_after: Option<usize>,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8], chunk: usize) -> Self {
        Self {
            data,
            chunk,
            fail_after: None,
        }
    }

    /// Reports a dropped connection once `offset` bytes have been delivered.
    #[cfg(test)]
    pub fn failing_after(mut self, offset: usize) -> Self {
        self.fail_after = Some(offset);
        self
    }
}

impl ChunkSource for SliceSource<'_> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(SourceError("connection reset".to_string()));
            }
        }

        let mut take = self.chunk.min(buf.len()).min(self.data.len());
        if let Some(remaining) = self.fail_after.as_mut() {
            take = take.min(*remaining);
            *remaining -= take;
        }
        buf[..take].copy_from_slice(&self.data[..take]);
        self.data = &self.data[take..];
        Ok(take)
    }
}

#[cfg(test)]
pub(crate) fn multipart_body(boundary: &str, image: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"update\"; filename=\"fw.bin\"\r\n\
          Content-Type: application/octet-stream\r\n\r\n",
    );
    body.extend_from_slice(image);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::OtaError, ota::scripted::ScriptedFlash};
    use pretty_assertions::assert_eq;

    const BOUNDARY: &str = "----multitoolBoundary7MA4YWxk";

    fn decode_all(body: &[u8], chunk: usize) -> Vec<u8> {
        let mut decoder = MultipartDecoder::new(BOUNDARY);
        let mut out = Vec::new();
        for piece in body.chunks(chunk) {
            decoder.feed(piece, &mut |bytes: &[u8]| out.extend_from_slice(bytes));
        }
        assert!(!decoder.truncated());
        out
    }

    #[test]
    fn boundary_parsed_from_content_type() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"abc123\""),
            Some("abc123".to_string())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }

    #[test]
    fn extracts_file_part_across_every_chunk_split() {
        // Image bytes include CR/LF and dashes that look like a delimiter start.
        let image: Vec<u8> = b"\xE9\x01\r\n--not-the-boundary\r\n\x00\xFF"
            .iter()
            .copied()
            .cycle()
            .take(300)
            .collect();
        let body = multipart_body(BOUNDARY, &image);

        for chunk in [1, 2, 3, 7, 31, 64, body.len()] {
            assert_eq!(decode_all(&body, chunk), image, "chunk size {chunk}");
        }
    }

    #[test]
    fn raw_body_passes_through() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        let image = vec![0xE9; 10_000];
        let mut source = SliceSource::new(&image, 1_460);

        let outcome = stream_upload(&mut session, &mut source, None, 4_096);

        assert!(matches!(
            outcome,
            OtaOutcome::Complete {
                bytes_written: 10_000,
                ..
            }
        ));
        assert_eq!(session.target().image, image);
    }

    #[test]
    fn multipart_upload_reaches_flash() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        let body = multipart_body(BOUNDARY, b"\xE9firmware");
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let mut source = SliceSource::new(&body, 5);

        let outcome = stream_upload(&mut session, &mut source, Some(&content_type), 16);

        assert!(matches!(outcome, OtaOutcome::Complete { bytes_written: 9, .. }));
        assert_eq!(session.target().image, b"\xE9firmware".to_vec());
    }

    #[test]
    fn dropped_connection_fails_session() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        let image = vec![0xE9; 512];
        let mut source = SliceSource::new(&image, 100).failing_after(200);

        let outcome = stream_upload(&mut session, &mut source, None, 64);

        assert_eq!(outcome, OtaOutcome::Failed(OtaError::Disconnected));
        assert_eq!(session.target().aborts, 1);
        assert_eq!(session.status(), crate::ota::OtaStatus::Idle);
    }

    #[test]
    fn truncated_multipart_counts_as_disconnect() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        let body = multipart_body(BOUNDARY, &[0xE9; 64]);
        let cut = &body[..body.len() - 20];
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let mut source = SliceSource::new(cut, 32);

        let outcome = stream_upload(&mut session, &mut source, Some(&content_type), 32);

        assert_eq!(outcome, OtaOutcome::Failed(OtaError::Disconnected));
    }

    #[test]
    fn form_without_file_part_is_empty() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--{BOUNDARY}--\r\n"
        );
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let mut source = SliceSource::new(body.as_bytes(), 8);

        let outcome = stream_upload(&mut session, &mut source, Some(&content_type), 8);

        assert_eq!(outcome, OtaOutcome::Failed(OtaError::Empty));
        assert_eq!(session.target().begins, 0);
    }
}
