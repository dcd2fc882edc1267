//! SMTP reply parsing and representation.

use super::error::{ClientError, Result};

/// A single line of a (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` for `250-` continuation lines, `true` for the final `250 ` line.
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, e.g. `354` after DATA
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Whether an EHLO reply advertises the given extension keyword.
    #[must_use]
    pub fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|kw| kw.eq_ignore_ascii_case(keyword))
        })
    }

    /// Turn the reply into an error so it can travel through `?`.
    #[must_use]
    pub fn into_error(self) -> ClientError {
        ClientError::SmtpError {
            code: self.code,
            message: self.message(),
        }
    }

    /// Parses a single reply line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        }

        let code_str = &line[..3];
        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;

            match first_code {
                Some(code) if parsed.code != code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line() {
        let line = ResponseLine {
            code: 220,
            is_last: true,
            message: "mail.example.com ESMTP".to_string(),
        };
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            line
        );
    }

    #[test]
    fn test_parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "SIZE 10000000", "STARTTLS"]
        );
        assert_eq!(consumed, data.len());
        assert!(response.advertises("starttls"));
        assert!(!response.advertises("mail.example.com"));
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let data = b"250 OK\r\n354 go ahead\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_incomplete_response() {
        assert!(
            Response::parse_response(b"250-mail.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_parse_rejects_code_mismatch() {
        assert!(Response::parse_response(b"250-first\r\n251 second\r\n").is_err());
    }

    #[test]
    fn test_reply_classes() {
        assert!(Response::new(250, vec!["OK".into()]).is_success());
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(!Response::new(452, vec![]).is_success());
        assert!(!Response::new(250, vec![]).is_intermediate());
    }

    #[test]
    fn test_into_error_keeps_code() {
        let err = Response::new(552, vec!["mailbox quota exceeded".into()]).into_error();
        assert_eq!(err.code(), Some(552));
        assert_eq!(err.detail(), "mailbox quota exceeded");
    }
}
