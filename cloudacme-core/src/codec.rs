//! JSON-lines codec for trigger events and their responses

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read one JSON value from the next non-blank line.
///
/// Returns `Ok(None)` at end of input. Oversized or malformed lines surface as
/// `InvalidData` so callers can answer them and keep reading.
pub async fn read_json_line_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if !buf.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    if buf.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "json line exceeds max length ({} > {})",
                buf.len(),
                max_bytes
            ),
        ));
    }

    let s = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    serde_json::from_str::<T>(s)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn read_json_line<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_json_line_with_limit(reader, DEFAULT_MAX_LINE_BYTES).await
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Answer every line of `reader` with one line on `writer`.
///
/// Lines that fail to decode are answered through `invalid_response` and do
/// not stop the loop. Events are handled strictly one after another.
pub async fn serve_json_lines<R, W, Req, Resp, F, Fut, InvalidResp>(
    reader: &mut R,
    writer: &mut W,
    handler: F,
    invalid_response: InvalidResp,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Resp>,
    InvalidResp: Fn(std::io::Error) -> Resp,
{
    loop {
        let Some(req) = (match read_json_line::<_, Req>(reader).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let resp = invalid_response(e);
                write_json_line(writer, &resp).await?;
                continue;
            }
            Err(e) => return Err(e),
        }) else {
            break;
        };

        let resp = handler(req).await;
        write_json_line(writer, &resp).await?;
    }

    Ok(())
}
