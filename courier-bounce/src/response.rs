//! SMTP reply parsing for the client session.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One complete server reply, possibly spanning multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    /// 2xx and 3xx replies let the session proceed.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    /// 4xx replies are worth retrying; everything else is permanent.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Read one reply, consuming continuation lines (`250-...`) until the
    /// final line (`250 ...`).
    ///
    /// # Errors
    /// On stream errors, premature close, or a malformed reply line.
    pub async fn read_from<R>(reader: &mut R) -> std::io::Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-reply",
                ));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);

            let code: u16 = trimmed
                .get(..3)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed reply line: {trimmed:?}"),
                    )
                })?;
            let last = !matches!(trimmed.as_bytes().get(3), Some(b'-'));
            lines.push(trimmed.get(4..).unwrap_or("").to_string());

            if last {
                return Ok(Self { code, lines });
            }
        }
    }

    /// The reply flattened into one diagnostic line.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" / "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn single_line_reply() {
        let mut input = Cursor::new(b"250 2.0.0 ok\r\n".to_vec());
        let response = Response::read_from(&mut input).await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["2.0.0 ok"]);
        assert!(response.is_positive());
    }

    #[tokio::test]
    async fn multi_line_reply_joins_at_the_final_line() {
        let mut input = Cursor::new(b"250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE\r\n".to_vec());
        let response = Response::read_from(&mut input).await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["mx.example.com", "PIPELINING", "SIZE"]);
    }

    #[tokio::test]
    async fn transient_and_permanent_classification() {
        let mut input = Cursor::new(b"421 try later\r\n".to_vec());
        let response = Response::read_from(&mut input).await.unwrap();
        assert!(!response.is_positive());
        assert!(response.is_transient());

        let mut input = Cursor::new(b"550 no\r\n".to_vec());
        let response = Response::read_from(&mut input).await.unwrap();
        assert!(!response.is_positive());
        assert!(!response.is_transient());
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let mut input = Cursor::new(b"pineapple\r\n".to_vec());
        assert!(Response::read_from(&mut input).await.is_err());
    }
}
