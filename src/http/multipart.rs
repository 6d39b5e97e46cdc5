//! multipart/form-data body parsing with spill-to-disk spooling.
//!
//! # Responsibilities
//! - Walk parts delimited by the Content-Type boundary token
//! - Keep small bodies in memory, spool large ones to a temp file
//! - Stop silently at a truncated stream, keeping what already parsed
//!
//! # Design Decisions
//! - The scan is line-based: content lines are re-joined with their own
//!   terminators, except the CRLF that immediately precedes a boundary,
//!   which belongs to the delimiter and is dropped
//! - Unknown-length bodies buffer in memory until the spool threshold,
//!   then flush once to disk and keep appending there (buffer-then-spill)

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Where an uploaded body lives.
pub enum FileBody {
    /// Below the spool threshold, held in memory.
    Memory(Bytes),
    /// Spooled to a temp file, deleted when dropped.
    Spooled(NamedTempFile),
}

/// One uploaded file, keyed in the request by its form field name.
pub struct UploadedFile {
    /// Client-supplied file name from Content-Disposition.
    pub file_name: String,
    /// Body length in bytes.
    pub len: u64,
    pub body: FileBody,
}

impl UploadedFile {
    pub fn is_spooled(&self) -> bool {
        matches!(self.body, FileBody::Spooled(_))
    }
}

/// Spooling knobs, from the upload configuration.
pub struct SpoolPolicy {
    pub threshold: usize,
    pub dir: Option<PathBuf>,
}

struct PartHeaders {
    field_name: Option<String>,
    file_name: Option<String>,
    declared_length: Option<u64>,
}

enum ScannedBody {
    Memory(Vec<u8>),
    Spooled(NamedTempFile, u64),
}

/// Parse one multipart body, accumulating text fields into `parameters`
/// and file parts into `files`.
///
/// Parsing is best-effort: a stream that ends without a terminating
/// boundary, or with truncated part headers, stops silently and leaves
/// everything parsed so far intact.
pub async fn parse<R: AsyncBufRead + Unpin>(
    body: &mut R,
    boundary: &str,
    policy: &SpoolPolicy,
    parameters: &mut HashMap<String, Vec<String>>,
    files: &mut HashMap<String, UploadedFile>,
) -> std::io::Result<()> {
    let delimiter = format!("--{boundary}").into_bytes();

    // Skip any preamble up to the first boundary line.
    loop {
        match read_line_bytes(body).await? {
            None => return Ok(()),
            Some(line) => {
                if let Some(closing) = boundary_line(&line, &delimiter) {
                    if closing {
                        return Ok(());
                    }
                    break;
                }
            }
        }
    }

    loop {
        let Some(headers) = read_part_headers(body).await? else {
            return Ok(());
        };

        let closing = match (&headers.field_name, &headers.file_name) {
            (Some(field), Some(file_name)) => {
                let (uploaded, closing) = match headers.declared_length {
                    Some(length) => {
                        let Some(uploaded) =
                            read_declared(body, &delimiter, length, file_name, policy).await?
                        else {
                            return Ok(());
                        };
                        (uploaded, false)
                    }
                    None => {
                        let (scanned, closing) = scan_body(body, &delimiter, policy).await?;
                        (into_uploaded(scanned, file_name), closing)
                    }
                };
                files.insert(field.clone(), uploaded);
                closing
            }
            (Some(field), None) => {
                let (scanned, closing) = scan_body(body, &delimiter, policy).await?;
                match scanned {
                    ScannedBody::Memory(bytes) => {
                        let value = String::from_utf8_lossy(&bytes).into_owned();
                        parameters.entry(field.clone()).or_default().push(value);
                    }
                    ScannedBody::Spooled(_, len) => {
                        tracing::warn!(field = %field, len, "text field exceeds spool threshold, discarded");
                    }
                }
                closing
            }
            (None, _) => {
                // No field name; drain to the next boundary and move on.
                let (_, closing) = scan_body(body, &delimiter, policy).await?;
                tracing::debug!("part without a field name skipped");
                closing
            }
        };
        if closing {
            return Ok(());
        }
    }
}

fn into_uploaded(scanned: ScannedBody, file_name: &str) -> UploadedFile {
    match scanned {
        ScannedBody::Memory(bytes) => UploadedFile {
            file_name: file_name.to_string(),
            len: bytes.len() as u64,
            body: FileBody::Memory(Bytes::from(bytes)),
        },
        ScannedBody::Spooled(file, len) => UploadedFile {
            file_name: file_name.to_string(),
            len,
            body: FileBody::Spooled(file),
        },
    }
}

/// Read one line including its terminator; `None` at EOF.
async fn read_line_bytes<R: AsyncBufRead + Unpin>(
    body: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = body.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// `Some(closing)` when `line` is a boundary line; closing boundaries
/// carry a trailing `--`.
fn boundary_line(line: &[u8], delimiter: &[u8]) -> Option<bool> {
    let stripped = strip_terminator(line).0;
    if !stripped.starts_with(delimiter) {
        return None;
    }
    Some(stripped[delimiter.len()..].starts_with(b"--"))
}

/// Split a line into (content, terminator). Only a trailing CRLF is a
/// terminator; a bare LF stays part of the content bytes so binary
/// payloads survive the line-based scan.
fn strip_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    if line.ends_with(b"\r\n") {
        line.split_at(line.len() - 2)
    } else {
        (line, &[])
    }
}

/// Read part headers up to the blank separator line; `None` when the
/// stream ends mid-headers.
async fn read_part_headers<R: AsyncBufRead + Unpin>(
    body: &mut R,
) -> std::io::Result<Option<PartHeaders>> {
    let mut headers = PartHeaders {
        field_name: None,
        file_name: None,
        declared_length: None,
    };
    loop {
        let Some(line) = read_line_bytes(body).await? else {
            return Ok(None);
        };
        let (content, _) = strip_terminator(&line);
        let content = match content {
            [rest @ .., b'\n'] => rest,
            other => other,
        };
        if content.is_empty() {
            return Ok(Some(headers));
        }
        let text = String::from_utf8_lossy(content);
        let Some((name, value)) = text.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "content-disposition" => {
                for attr in value.split(';').skip(1) {
                    let Some((key, raw)) = attr.split_once('=') else {
                        continue;
                    };
                    let unquoted = raw.trim().trim_matches('"').to_string();
                    match key.trim() {
                        "name" => headers.field_name = Some(unquoted),
                        "filename" => headers.file_name = Some(unquoted),
                        _ => {}
                    }
                }
            }
            "content-length" => {
                headers.declared_length = value.parse().ok();
            }
            _ => {}
        }
    }
}

/// Read a part body whose length was declared up front, then consume the
/// trailing boundary line. `None` means the stream ended short and the
/// part is abandoned.
async fn read_declared<R: AsyncBufRead + Unpin>(
    body: &mut R,
    delimiter: &[u8],
    length: u64,
    file_name: &str,
    policy: &SpoolPolicy,
) -> std::io::Result<Option<UploadedFile>> {
    let uploaded = if length < policy.threshold as u64 {
        let mut buf = vec![0u8; length as usize];
        match body.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::warn!(file = %file_name, length, "declared length exceeds stream, part abandoned");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        UploadedFile {
            file_name: file_name.to_string(),
            len: length,
            body: FileBody::Memory(Bytes::from(buf)),
        }
    } else {
        let spool = new_spool_file(policy)?;
        let mut sink = tokio::fs::File::from_std(spool.reopen()?);
        let copied = tokio::io::copy(&mut (&mut *body).take(length), &mut sink).await?;
        sink.flush().await?;
        if copied < length {
            tracing::warn!(file = %file_name, length, copied, "declared length exceeds stream, part abandoned");
            return Ok(None);
        }
        UploadedFile {
            file_name: file_name.to_string(),
            len: length,
            body: FileBody::Spooled(spool),
        }
    };

    // The declared bytes are followed by CRLF and the next boundary.
    loop {
        match read_line_bytes(body).await? {
            None => return Ok(Some(uploaded)),
            Some(line) => {
                if boundary_line(&line, delimiter).is_some() {
                    return Ok(Some(uploaded));
                }
            }
        }
    }
}

fn new_spool_file(policy: &SpoolPolicy) -> std::io::Result<NamedTempFile> {
    match &policy.dir {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
}

/// Scan line-by-line to the next boundary, buffering in memory and
/// spilling to a temp file once the buffer crosses the threshold.
/// Returns the body and whether the boundary seen was the closing one
/// (EOF counts as closing).
async fn scan_body<R: AsyncBufRead + Unpin>(
    body: &mut R,
    delimiter: &[u8],
    policy: &SpoolPolicy,
) -> std::io::Result<(ScannedBody, bool)> {
    let mut memory: Vec<u8> = Vec::new();
    let mut spool: Option<(NamedTempFile, tokio::fs::File, u64)> = None;
    // CRLF held back until the next line proves it was interior, not the
    // separator before the boundary.
    let mut pending_crlf = false;

    loop {
        if spool.is_none() && memory.len() >= policy.threshold {
            let file = new_spool_file(policy)?;
            let mut sink = tokio::fs::File::from_std(file.reopen()?);
            sink.write_all(&memory).await?;
            let len = memory.len() as u64;
            memory.clear();
            spool = Some((file, sink, len));
        }

        let closing = match read_line_bytes(body).await? {
            None => true,
            Some(line) => match boundary_line(&line, delimiter) {
                Some(closing) => closing,
                None => {
                    let (content, terminator) = strip_terminator(&line);
                    let mut chunk = Vec::with_capacity(content.len() + 2);
                    if pending_crlf {
                        chunk.extend_from_slice(b"\r\n");
                    }
                    chunk.extend_from_slice(content);
                    pending_crlf = !terminator.is_empty();
                    match &mut spool {
                        Some((_, sink, len)) => {
                            sink.write_all(&chunk).await?;
                            *len += chunk.len() as u64;
                        }
                        None => memory.extend_from_slice(&chunk),
                    }
                    continue;
                }
            },
        };

        return match spool {
            Some((file, mut sink, len)) => {
                sink.flush().await?;
                Ok((ScannedBody::Spooled(file, len), closing))
            }
            None => Ok((ScannedBody::Memory(memory), closing)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn policy(threshold: usize) -> SpoolPolicy {
        SpoolPolicy {
            threshold,
            dir: None,
        }
    }

    async fn run(
        body: &[u8],
        boundary: &str,
        threshold: usize,
    ) -> (HashMap<String, Vec<String>>, HashMap<String, UploadedFile>) {
        let mut parameters = HashMap::new();
        let mut files = HashMap::new();
        let mut cursor = std::io::Cursor::new(body.to_vec());
        let mut reader = tokio::io::BufReader::new(&mut cursor);
        parse(
            &mut reader,
            boundary,
            &policy(threshold),
            &mut parameters,
            &mut files,
        )
        .await
        .unwrap();
        (parameters, files)
    }

    fn simple_body(file_payload: &[u8], declared: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"name\"\r\n\r\n");
        body.extend_from_slice(b"foo\r\n");
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n",
        );
        if declared {
            body.extend_from_slice(format!("Content-Length: {}\r\n", file_payload.len()).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(file_payload);
        body.extend_from_slice(b"\r\n--xyz--\r\n");
        body
    }

    #[tokio::test]
    async fn small_declared_file_stays_in_memory() {
        let body = simple_body(b"hello world", true);
        let (parameters, files) = run(&body, "xyz", 1024).await;

        assert_eq!(parameters["name"], vec!["foo"]);
        let file = &files["upload"];
        assert_eq!(file.file_name, "a.bin");
        assert_eq!(file.len, 11);
        assert!(!file.is_spooled());
        let FileBody::Memory(bytes) = &file.body else {
            panic!("expected in-memory body");
        };
        assert_eq!(bytes.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn large_declared_file_spools_to_disk() {
        let payload = vec![0x41u8; 256];
        let body = simple_body(&payload, true);
        let (_, files) = run(&body, "xyz", 64).await;

        let file = &files["upload"];
        assert!(file.is_spooled());
        assert_eq!(file.len, 256);
        let FileBody::Spooled(temp) = &file.body else {
            panic!("expected spooled body");
        };
        let mut contents = Vec::new();
        temp.reopen().unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, payload);
    }

    #[tokio::test]
    async fn unknown_length_scan_keeps_interior_crlf() {
        let payload = b"line one\r\nline two";
        let body = simple_body(payload, false);
        let (_, files) = run(&body, "xyz", 1024).await;

        let file = &files["upload"];
        let FileBody::Memory(bytes) = &file.body else {
            panic!("expected in-memory body");
        };
        assert_eq!(bytes.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn unknown_length_scan_spills_at_threshold() {
        let payload = vec![0x42u8; 300];
        let body = simple_body(&payload, false);
        let (_, files) = run(&body, "xyz", 100).await;

        let file = &files["upload"];
        assert!(file.is_spooled());
        assert_eq!(file.len, 300);
        let FileBody::Spooled(temp) = &file.body else {
            panic!("expected spooled body");
        };
        let mut contents = Vec::new();
        temp.reopen().unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, payload);
    }

    #[tokio::test]
    async fn truncated_stream_keeps_already_parsed_parts() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"name\"\r\n\r\n");
        body.extend_from_slice(b"foo\r\n");
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(b"Content-Disposition: form-da");
        let (parameters, files) = run(&body, "xyz", 1024).await;

        assert_eq!(parameters["name"], vec!["foo"]);
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn declared_length_past_stream_end_abandons_that_part() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--xyz\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Length: 4096\r\n\r\n");
        body.extend_from_slice(b"short");
        let (_, files) = run(&body, "xyz", 8192).await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn repeated_text_fields_accumulate() {
        let mut body = Vec::new();
        for value in ["a", "b"] {
            body.extend_from_slice(b"--xyz\r\n");
            body.extend_from_slice(b"Content-Disposition: form-data; name=\"tag\"\r\n\r\n");
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"--xyz--\r\n");
        let (parameters, _) = run(&body, "xyz", 1024).await;
        assert_eq!(parameters["tag"], vec!["a", "b"]);
    }

    #[tokio::test]
    async fn spooled_file_is_deleted_on_drop() {
        let payload = vec![0x43u8; 256];
        let body = simple_body(&payload, true);
        let (_, mut files) = run(&body, "xyz", 64).await;

        let file = files.remove("upload").unwrap();
        let FileBody::Spooled(temp) = file.body else {
            panic!("expected spooled body");
        };
        let path = temp.path().to_path_buf();
        assert!(path.exists());
        drop(temp);
        assert!(!path.exists());
    }
}
