// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Version exchange, RFC 4253 §4.2. The server may send any number of
//! banner lines before its identification string; they are skipped. The
//! identification line itself is capped at 255 bytes including CRLF.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::Error;

/// The maximum length of the identification line, CRLF included.
const MAX_ID_LEN: usize = 255;

/// How much pre-banner data we tolerate before giving up.
const MAX_BANNER_LEN: usize = 64 * 1024;

/// A stream wrapper that scans the SSH identification line and then hands
/// any bytes read past it back to the regular read path.
pub struct SshRead<R> {
    leftover: Option<Leftover>,
    stream: R,
}

struct Leftover {
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> SshRead<R> {
    pub fn new(stream: R) -> Self {
        SshRead {
            leftover: None,
            stream,
        }
    }

    /// Read lines until the peer's `SSH-…` identification string shows up,
    /// skipping preceding banner lines. Returns the id without CRLF.
    pub async fn read_ssh_id(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        let mut scan = 0;
        loop {
            let mut chunk = [0; 256];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::HUP);
            }
            buf.extend_from_slice(chunk.get(..n).ok_or(Error::IndexOutOfBounds)?);

            while let Some(eol) = buf
                .get(scan..)
                .and_then(|rest| rest.iter().position(|&c| c == b'\n'))
            {
                let line_end = scan + eol;
                let line = buf.get(scan..line_end).ok_or(Error::IndexOutOfBounds)?;
                let line = match line.split_last() {
                    Some((&b'\r', head)) => head,
                    _ => line,
                };
                if line.starts_with(b"SSH-") {
                    if line_end - scan + 1 > MAX_ID_LEN {
                        return Err(Error::Version);
                    }
                    if !(line.starts_with(b"SSH-2.0-") || line.starts_with(b"SSH-1.99-")) {
                        return Err(Error::Version);
                    }
                    let id = line.to_vec();
                    if line_end + 1 < buf.len() {
                        self.leftover = Some(Leftover {
                            buf: buf.split_off(line_end + 1),
                            pos: 0,
                        });
                    }
                    return Ok(id);
                }
                // Not a version line; ignore it and keep scanning.
                scan = line_end + 1;
            }
            // Unfinished version lines are bounded; banner lines get a
            // looser cap (OpenSSH allows up to 1024 per line).
            if buf.len() - scan > 1024 || scan > MAX_BANNER_LEN {
                return Err(Error::Version);
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SshRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        if let Some(ref mut leftover) = self.leftover {
            let remaining = leftover.buf.get(leftover.pos..).unwrap_or_default();
            if !remaining.is_empty() {
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(remaining.get(..n).unwrap_or_default());
                leftover.pos += n;
                if leftover.pos >= leftover.buf.len() {
                    self.leftover = None;
                }
                return Poll::Ready(Ok(()));
            }
            self.leftover = None;
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for SshRead<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;

    #[tokio::test]
    async fn skips_banner_lines() {
        let mut r = SshRead::new(&b"Welcome\r\nSSH-2.0-OpenSSH_9.0\r\n"[..]);
        let id = r.read_ssh_id().await.unwrap();
        assert_eq!(id, b"SSH-2.0-OpenSSH_9.0");
    }

    #[tokio::test]
    async fn keeps_bytes_past_the_id() {
        let mut r = SshRead::new(&b"SSH-2.0-x\r\n\x00\x00\x00\x04rest"[..]);
        let id = r.read_ssh_id().await.unwrap();
        assert_eq!(id, b"SSH-2.0-x");
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x00\x00\x04rest");
    }

    #[tokio::test]
    async fn rejects_unknown_protocol_versions() {
        let mut r = SshRead::new(&b"SSH-1.5-old\r\n"[..]);
        assert!(matches!(r.read_ssh_id().await, Err(Error::Version)));
    }

    #[tokio::test]
    async fn rejects_oversized_id() {
        let mut line = b"SSH-2.0-".to_vec();
        line.resize(300, b'x');
        line.extend_from_slice(b"\r\n");
        let mut r = SshRead::new(&line[..]);
        assert!(matches!(r.read_ssh_id().await, Err(Error::Version)));
    }
}
