use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::{DEFAULT_MAX_ARGS, DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_LINE_LEN};
use crate::error::DbError;

/// Guard rails for one parsed command; a client exceeding any of them is
/// protocol-broken and gets disconnected.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WireLimits {
    pub max_args: usize,
    pub max_bulk: usize,
    pub max_line: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_args: DEFAULT_MAX_ARGS,
            max_bulk: DEFAULT_MAX_BULK_LEN,
            max_line: DEFAULT_MAX_LINE_LEN,
        }
    }
}

fn proto_err(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn eof_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection cut mid-command")
}

fn ascii_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Pull one CRLF-terminated line into `line` (terminator removed).
/// `Ok(false)` is a clean end of stream before any byte arrived.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_line: usize,
) -> std::io::Result<bool> {
    line.clear();
    // Allow the terminator itself on top of the payload budget.
    let mut budget = max_line.saturating_add(2);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return if line.is_empty() { Ok(false) } else { Err(eof_err()) };
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let take = nl + 1;
                if take > budget {
                    return Err(proto_err("line too long"));
                }
                line.extend_from_slice(&available[..take]);
                reader.consume(take);
                break;
            }
            None => {
                let take = available.len();
                if take > budget {
                    return Err(proto_err("line too long"));
                }
                budget -= take;
                line.extend_from_slice(available);
                reader.consume(take);
            }
        }
    }
    line.pop(); // the newline that ended the loop
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max_line {
        return Err(proto_err("line too long"));
    }
    Ok(true)
}

/// One bulk string: `$<len>` header line, then payload and CRLF.
/// A negative length (null bulk) decodes as an empty argument.
async fn read_bulk<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    scratch: &mut Vec<u8>,
    limits: WireLimits,
) -> std::io::Result<Vec<u8>> {
    if !read_line_bounded(reader, scratch, limits.max_line).await? {
        return Err(eof_err());
    }
    let declared = scratch
        .strip_prefix(b"$")
        .and_then(ascii_i64)
        .ok_or_else(|| proto_err("bad bulk header"))?;
    if declared < 0 {
        return Ok(Vec::new());
    }
    let len = usize::try_from(declared).map_err(|_| proto_err("bad bulk header"))?;
    if len > limits.max_bulk {
        return Err(proto_err("bulk string too large"));
    }
    let mut payload = vec![0u8; len + 2];
    reader.read_exact(&mut payload).await?;
    payload.truncate(len); // drop the trailing CRLF
    Ok(payload)
}

async fn read_array<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    header: &[u8],
    limits: WireLimits,
) -> std::io::Result<Vec<Vec<u8>>> {
    let declared = ascii_i64(header).ok_or_else(|| proto_err("bad array header"))?;
    if declared < 0 {
        return Ok(Vec::new()); // null array
    }
    let count = usize::try_from(declared).map_err(|_| proto_err("bad array header"))?;
    if count > limits.max_args {
        return Err(proto_err("too many arguments"));
    }
    let mut args = Vec::with_capacity(count);
    let mut scratch = Vec::new();
    for _ in 0..count {
        args.push(read_bulk(reader, &mut scratch, limits).await?);
    }
    Ok(args)
}

/// Read one command off the wire: a RESP2 array of bulk strings, or an
/// inline command split on whitespace. `Ok(None)` means the peer closed the
/// connection between commands.
pub(crate) async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    read_command_with(reader, WireLimits::default()).await
}

pub(crate) async fn read_command_with<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limits: WireLimits,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = Vec::new();
    if !read_line_bounded(reader, &mut line, limits.max_line).await? {
        return Ok(None);
    }
    match line.first() {
        None => Ok(Some(Vec::new())),
        Some(&b'*') => read_array(reader, &line[1..], limits).await.map(Some),
        Some(_) => {
            let args: Vec<Vec<u8>> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|token| !token.is_empty())
                .map(|token| token.to_vec())
                .collect();
            if args.len() > limits.max_args {
                return Err(proto_err("too many arguments"));
            }
            Ok(Some(args))
        }
    }
}

// ── Reply builders ────────────────────────────────────────────────────────────
//
// Everything the server says funnels through `status_line` and `append_bulk`,
// so the CRLF discipline lives in exactly two places.

fn status_line(marker: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 3);
    out.push(marker);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) fn resp_ok() -> Vec<u8> {
    status_line(b'+', b"OK")
}

pub(crate) fn resp_pong() -> Vec<u8> {
    status_line(b'+', b"PONG")
}

pub(crate) fn resp_simple(msg: &str) -> Vec<u8> {
    status_line(b'+', msg.as_bytes())
}

pub(crate) fn resp_null() -> Vec<u8> {
    status_line(b'$', b"-1")
}

pub(crate) fn resp_int(n: i64) -> Vec<u8> {
    status_line(b':', n.to_string().as_bytes())
}

pub(crate) fn resp_err(msg: &str) -> Vec<u8> {
    status_line(b'-', format!("ERR {msg}").as_bytes())
}

/// Bare-tag error reply, e.g. `-bad [SEQ]`.
pub(crate) fn resp_err_tag(tag: &str) -> Vec<u8> {
    status_line(b'-', tag.as_bytes())
}

pub(crate) fn resp_wrongtype() -> Vec<u8> {
    status_line(
        b'-',
        b"WRONGTYPE Operation against a key holding the wrong kind of value",
    )
}

/// Put a storage-layer fault on the wire. Store faults get the IOERR class
/// so clients can tell an ailing disk from a usage mistake; corruption and
/// log-window errors stay ordinary errors.
pub(crate) fn resp_db_err(e: &DbError) -> Vec<u8> {
    match e {
        DbError::CorruptKey(_) | DbError::SeqBelowWindow { .. } => {
            status_line(b'-', format!("ERR {e}").as_bytes())
        }
        _ => status_line(b'-', format!("IOERR {e}").as_bytes()),
    }
}

pub(crate) fn wrong_args(cmd: &[u8]) -> Vec<u8> {
    resp_err(&format!(
        "wrong number of arguments for {}",
        String::from_utf8_lossy(cmd)
    ))
}

pub(crate) fn append_array_header(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(format!("*{len}\r\n").as_bytes());
}

pub(crate) fn append_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn append_null(out: &mut Vec<u8>) {
    out.extend_from_slice(b"$-1\r\n");
}

pub(crate) fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    append_bulk(&mut out, data);
    out
}

pub(crate) fn resp_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    append_array_header(&mut out, items.len());
    for item in items {
        append_bulk(&mut out, item);
    }
    out
}

/// Serialize a command as a RESP array of bulk strings — the exact bytes the
/// sync log records and the replication frames are sent as.
pub(crate) fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    append_array_header(&mut out, args.len());
    for arg in args {
        append_bulk(&mut out, arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(bytes: &[u8]) -> std::io::Result<Option<Vec<Vec<u8>>>> {
        let mut reader = BufReader::new(bytes);
        read_command(&mut reader).await
    }

    fn strings(args: Option<Vec<Vec<u8>>>) -> Vec<String> {
        args.unwrap()
            .into_iter()
            .map(|a| String::from_utf8_lossy(&a).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn array_command_decodes() {
        let got = parse(b"*3\r\n$5\r\nLPUSH\r\n$5\r\nqueue\r\n$5\r\njob-1\r\n")
            .await
            .unwrap();
        assert_eq!(strings(got), ["LPUSH", "queue", "job-1"]);
    }

    #[tokio::test]
    async fn inline_command_splits_on_whitespace() {
        let got = parse(b"ZCARD  board\r\n").await.unwrap();
        assert_eq!(strings(got), ["ZCARD", "board"]);
    }

    #[tokio::test]
    async fn closed_stream_yields_none() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_line_yields_empty_command() {
        assert!(parse(b"\r\n").await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_cut_inside_array_is_an_error() {
        let err = parse(b"*2\r\n$3\r\nGET\r\n").await.expect_err("cut input");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn null_bulk_decodes_as_empty_argument() {
        let got = parse(b"*2\r\n$3\r\nGET\r\n$-1\r\n").await.unwrap().unwrap();
        assert_eq!(got[1], b"");
    }

    #[tokio::test]
    async fn binary_payload_survives_intact() {
        let mut wire = b"*2\r\n$3\r\nSET\r\n$3\r\n".to_vec();
        wire.extend_from_slice(&[0x00, 0xff, 0x23]);
        wire.extend_from_slice(b"\r\n");
        let got = parse(&wire).await.unwrap().unwrap();
        assert_eq!(got[1], vec![0x00, 0xff, 0x23]);
    }

    #[tokio::test]
    async fn oversized_array_is_refused() {
        let limits = WireLimits {
            max_args: 1,
            ..WireLimits::default()
        };
        let mut reader = BufReader::new(&b"*2\r\n$1\r\na\r\n$1\r\nb\r\n"[..]);
        let err = read_command_with(&mut reader, limits)
            .await
            .expect_err("two args against a cap of one");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_bulk_is_refused() {
        let limits = WireLimits {
            max_bulk: 3,
            ..WireLimits::default()
        };
        let mut reader = BufReader::new(&b"*1\r\n$4\r\nPING\r\n"[..]);
        let err = read_command_with(&mut reader, limits)
            .await
            .expect_err("four bytes against a cap of three");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn overlong_line_is_refused() {
        let limits = WireLimits {
            max_line: 4,
            ..WireLimits::default()
        };
        let mut reader = BufReader::new(&b"ZCARD board\r\n"[..]);
        let err = read_command_with(&mut reader, limits)
            .await
            .expect_err("line past the cap");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn garbage_bulk_header_is_refused() {
        let err = parse(b"*1\r\n:5\r\n").await.expect_err("not a bulk header");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn encode_command_parses_back() {
        let encoded = encode_command(&[b"SET", b"k1", b"v1"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n");
        let got = parse(&encoded).await.unwrap();
        assert_eq!(strings(got), ["SET", "k1", "v1"]);
    }

    #[test]
    fn builders_emit_expected_frames() {
        assert_eq!(resp_ok(), b"+OK\r\n");
        assert_eq!(resp_int(-7), b":-7\r\n");
        assert_eq!(resp_null(), b"$-1\r\n");
        assert_eq!(resp_bulk(b"hi"), b"$2\r\nhi\r\n");
        assert_eq!(
            resp_array(&[b"a".to_vec(), b"b".to_vec()]),
            b"*2\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
        assert_eq!(resp_err_tag("bad [SEQ]"), b"-bad [SEQ]\r\n");
    }

    #[test]
    fn db_errors_carry_their_class() {
        let io = resp_db_err(&DbError::Write("disk full".into()));
        assert!(io.starts_with(b"-IOERR "), "got {io:?}");
        let corrupt = resp_db_err(&DbError::CorruptKey("bad sign".into()));
        assert!(corrupt.starts_with(b"-ERR "), "got {corrupt:?}");
    }
}
