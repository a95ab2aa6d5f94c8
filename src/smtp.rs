/* SMTP front end: one SmtpServer per client connection */

use log::{trace, debug, info, warn, error};
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::graph::{MailSubmitter, Submission};
use crate::mail::decode_message;
use crate::oauth::TokenSource;

const MAX_COMMAND_LINE: usize = 4096;
const DATA_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpState {
    Greeting,
    AwaitCommand,
    Authenticating,
    Authenticated,
    InData,
    Closed
}

/// What every connection shares: token cache, mail API client and settings.
pub struct Relay {
    pub tokens: Arc<dyn TokenSource>,
    pub mailer: Arc<dyn MailSubmitter>,
    pub host_name: String,
    pub fallback: Option<(String, String)>,
    pub max_message_bytes: usize
}

#[derive(Default)]
struct Session {
    username: String,
    password: String,
    authenticated: bool,
    from: String,
    to: Vec<String>
}

enum RawLine {
    Line(Vec<u8>),
    TooLong(Vec<u8>),
    Eof
}

enum DataOutcome {
    Complete(Vec<u8>),
    Oversized,
    Eof
}

pub struct SmtpServer<R, W> {
    state: SmtpState,
    relay: Arc<Relay>,
    reader: R,
    writer: W,
    session: Session
}

impl<R: BufRead, W: Write> SmtpServer<R, W> {

    const OK: &'static [u8] = b"250 2.0.0 Ok\r\n";
    const SENDER_OK: &'static [u8] = b"250 2.1.0 Ok\r\n";
    const RECIPIENT_OK: &'static [u8] = b"250 2.1.5 Ok\r\n";
    const QUEUED: &'static [u8] = b"250 2.0.0 Ok: queued as graphapi\r\n";
    const USERNAME_PROMPT: &'static [u8] = b"334 VXNlcm5hbWU6\r\n";
    const PASSWORD_PROMPT: &'static [u8] = b"334 UGFzc3dvcmQ6\r\n";
    const AUTH_OK: &'static [u8] = b"235 2.7.0 Authentication successful\r\n";
    const SEND_DATA: &'static [u8] = b"354 End data with <CR><LF>.<CR><LF>\r\n";
    const BYE: &'static [u8] = b"221 2.0.0 Bye\r\n";
    const SERVICE_UNAVAILABLE: &'static [u8] = b"421 4.7.0 Service not available\r\n";
    const TEMP_AUTH_FAILURE: &'static [u8] = b"451 4.7.0 Temporary authentication failure\r\n";
    const LINE_TOO_LONG: &'static [u8] = b"500 5.5.6 Line too long\r\n";
    const NOT_IMPLEMENTED: &'static [u8] = b"502 5.5.2 Command not implemented\r\n";
    const UNKNOWN_MECHANISM: &'static [u8] = b"504 5.5.4 Unrecognized authentication type\r\n";
    const AUTH_REQUIRED: &'static [u8] = b"530 5.7.0 Authentication required\r\n";
    const AUTH_FAILED: &'static [u8] = b"535 5.7.8 Authentication credentials invalid\r\n";
    const TOO_LARGE: &'static [u8] = b"552 5.3.4 Message size exceeds fixed limit\r\n";

    pub fn new(relay: Arc<Relay>, reader: R, writer: W) -> Self {
        Self {
            state: SmtpState::Greeting,
            relay,
            reader,
            writer,
            session: Session::default()
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    /// Runs the dialogue until the client quits, disconnects or is dropped.
    ///
    /// Protocol-level failures are answered and end in `Ok`. Only transport
    /// errors come back as `Err`, after a best-effort 421.
    pub fn serve(&mut self) -> Result<()> {
        match self.run() {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Client read error: {err}");

                // the peer may already be gone
                let _ = self.reply(Self::SERVICE_UNAVAILABLE);
                self.state = SmtpState::Closed;

                Err(err.into())
            }
        }
    }

    fn run(&mut self) -> io::Result<()> {
        let banner = format!("220 {} SMTP Relay Ready\r\n", self.relay.host_name);

        self.reply(banner.as_bytes())?;
        self.state = SmtpState::AwaitCommand;

        while self.state != SmtpState::Closed {
            let Some(line) = self.read_command_line()? else {
                break;
            };

            if line.is_empty() {
                continue;
            }

            debug!("Received SMTP command: {}", redact(&line));

            self.handle_line(&line)?;
        }

        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> io::Result<()> {
        let (verb, args) = split_command(line);

        match verb.as_str() {
            "EHLO" | "HELO" => {
                let greeting = format!("250-{}\r\n250 AUTH LOGIN\r\n", self.relay.host_name);
                self.reply(greeting.as_bytes())
            },
            "AUTH" => self.auth(args),
            _ if !self.session.authenticated => {
                warn!("Authentication required for command: {verb}");
                self.reply(Self::AUTH_REQUIRED)
            },
            "MAIL" if has_prefix(args, "FROM:") => {
                self.session.from = extract_address(line);
                debug!("Mail from: {}", self.session.from);
                self.reply(Self::SENDER_OK)
            },
            "RCPT" if has_prefix(args, "TO:") => {
                let address = extract_address(line);

                if address.is_empty() {
                    warn!("Received empty TO address");
                } else {
                    debug!("Mail to: {address}");
                    self.session.to.push(address);
                }

                self.reply(Self::RECIPIENT_OK)
            },
            "DATA" => self.data(),
            "RSET" => {
                debug!("Resetting");
                self.reset_transaction();
                self.reply(Self::OK)
            },
            "NOOP" => self.reply(Self::OK),
            "QUIT" => {
                debug!("Got QUIT");
                self.state = SmtpState::Closed;
                self.reply(Self::BYE)
            },
            _ => {
                warn!("Unexpected command: {verb}");
                self.reply(Self::NOT_IMPLEMENTED)
            }
        }
    }

    fn auth(&mut self, args: &str) -> io::Result<()> {
        let mut parts = args.split_whitespace();
        let mechanism = parts.next().unwrap_or_default();

        if !mechanism.eq_ignore_ascii_case("LOGIN") {
            warn!("Unsupported AUTH mechanism: {mechanism}");
            return self.reply(Self::UNKNOWN_MECHANISM);
        }

        self.state = SmtpState::Authenticating;

        let username = match parts.next() {
            Some(inline) => decode_base64(inline),
            None => {
                self.reply(Self::USERNAME_PROMPT)?;

                let Some(line) = self.read_command_line()? else {
                    return Ok(());
                };
                decode_base64(&line)
            }
        };

        debug!("AUTH LOGIN username: {username}");

        self.reply(Self::PASSWORD_PROMPT)?;

        let Some(line) = self.read_command_line()? else {
            return Ok(());
        };
        let password = decode_base64(&line);

        let (username, password) = if username.is_empty() || password.is_empty() {
            match &self.relay.fallback {
                Some((user, pass)) => {
                    debug!("Using fallback credentials for {user}");
                    (user.clone(), pass.clone())
                },
                None => {
                    error!("Authentication failed: no credentials provided");
                    return self.fail(Self::AUTH_FAILED);
                }
            }
        } else {
            (username, password)
        };

        // a token exchange is the only way to check the password
        if let Err(err) = self.relay.tokens.acquire(&username, &password) {
            error!("OAuth2 token retrieval failed for {username}: {err}");
            return self.fail(Self::AUTH_FAILED);
        }

        info!("User authenticated: {username}");

        self.session.username = username;
        self.session.password = password;
        self.session.authenticated = true;
        self.state = SmtpState::Authenticated;

        self.reply(Self::AUTH_OK)
    }

    fn data(&mut self) -> io::Result<()> {
        self.reply(Self::SEND_DATA)?;
        self.state = SmtpState::InData;

        let data = match self.read_data()? {
            DataOutcome::Complete(data) => data,
            DataOutcome::Oversized => {
                warn!("Message exceeds {} bytes, discarded", self.relay.max_message_bytes);
                self.state = SmtpState::Authenticated;
                self.reset_transaction();
                return self.reply(Self::TOO_LARGE);
            },
            DataOutcome::Eof => {
                debug!("Client disconnected during DATA");
                self.state = SmtpState::Closed;
                return Ok(());
            }
        };

        self.state = SmtpState::Authenticated;

        let raw = normalize_crlf(&data);
        trace!("DATA: {} bytes", raw.len());

        let message = match decode_message(&raw) {
            Ok(message) => message,
            Err(err) => {
                error!("MIME parsing failed: {err}");
                let reply = format!("550 5.6.0 Message parsing failed: {}\r\n", one_line(&err.to_string()));
                return self.fail(reply.as_bytes());
            }
        };

        let token = match self.relay.tokens.acquire(&self.session.username, &self.session.password) {
            Ok(token) => token,
            Err(err) => {
                error!("Failed to get OAuth2 token for {}: {err}", self.session.username);
                return self.fail(Self::TEMP_AUTH_FAILURE);
            }
        };

        let submission = Submission {
            account: &self.session.username,
            from: &self.session.from,
            recipients: &self.session.to,
            message: &message
        };

        if let Err(err) = self.relay.mailer.submit(&token, &submission) {
            error!("Failed to send email via Graph API for {} (from {}, to {}): {err}",
                self.session.username, self.session.from, self.session.to.join(","));
            let reply = format!("550 5.7.0 Delivery failed: {}\r\n", one_line(&err.to_string()));
            return self.fail(reply.as_bytes());
        }

        info!("E-mail sent successfully for {} FROM: {} TO: {} subject: {:?}",
            self.session.username, self.session.from, self.session.to.join(","), message.subject);

        self.reset_transaction();
        self.reply(Self::QUEUED)
    }

    /// Reads up to the terminating `.` line, undoing dot-stuffing.
    ///
    /// Past the size limit the rest of the message is still consumed so the
    /// client stays in sync, but nothing more is kept.
    fn read_data(&mut self) -> io::Result<DataOutcome> {
        let limit = self.relay.max_message_bytes;
        let mut data = Vec::new();
        let mut oversized = false;
        let mut line_start = true;

        loop {
            let mut chunk = match self.read_raw(DATA_CHUNK)? {
                RawLine::Line(chunk) | RawLine::TooLong(chunk) => chunk,
                RawLine::Eof => return Ok(DataOutcome::Eof)
            };

            let complete = chunk.ends_with(b"\n");

            if line_start && complete && String::from_utf8_lossy(&chunk).trim() == "." {
                break;
            }

            if line_start && chunk.first() == Some(&b'.') {
                chunk.remove(0);
            }

            line_start = complete;

            if oversized || data.len() + chunk.len() > limit {
                oversized = true;
                data = Vec::new();
                continue;
            }

            data.extend_from_slice(&chunk);
        }

        Ok(match oversized {
            true => DataOutcome::Oversized,
            false => DataOutcome::Complete(data)
        })
    }

    /// Next command line without its terminator. `None` once the connection
    /// is over, either because the client went away or the line was too long.
    fn read_command_line(&mut self) -> io::Result<Option<String>> {
        match self.read_raw(MAX_COMMAND_LINE)? {
            RawLine::Line(line) => {
                let line = String::from_utf8_lossy(&line);

                // AUTH LOGIN responses are credentials
                if self.state != SmtpState::Authenticating {
                    trace!("Read line: {}", redact(line.trim_end()));
                }

                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            },
            RawLine::TooLong(_) => {
                warn!("Command line longer than {MAX_COMMAND_LINE} bytes, closing");
                self.fail(Self::LINE_TOO_LONG)?;
                Ok(None)
            },
            RawLine::Eof => {
                debug!("Client disconnected (or EOF)");
                self.state = SmtpState::Closed;
                Ok(None)
            }
        }
    }

    fn read_raw(&mut self, limit: usize) -> io::Result<RawLine> {
        let mut buf = Vec::new();
        let n = (&mut self.reader).take(limit as u64).read_until(b'\n', &mut buf)?;

        if n == 0 {
            return Ok(RawLine::Eof);
        }

        if n >= limit && !buf.ends_with(b"\n") {
            return Ok(RawLine::TooLong(buf));
        }

        Ok(RawLine::Line(buf))
    }

    fn reply(&mut self, resp: &[u8]) -> io::Result<()> {
        self.writer.write_all(resp)?;
        self.writer.flush()
    }

    /// Sends a final reply and ends the session.
    fn fail(&mut self, resp: &[u8]) -> io::Result<()> {
        self.reset_transaction();
        self.state = SmtpState::Closed;
        self.reply(resp)
    }

    fn reset_transaction(&mut self) {
        self.session.from = String::new();
        self.session.to = Vec::new();
    }

}

/// Uppercased verb and the rest of the line.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim_start();

    match line.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim_start()),
        None => (line.to_ascii_uppercase(), "")
    }
}

fn has_prefix(args: &str, prefix: &str) -> bool {
    args.len() >= prefix.len()
        && args.is_char_boundary(prefix.len())
        && args[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Pulls the address out of a MAIL FROM / RCPT TO line.
///
/// Prefers `<...>`; otherwise whatever follows the first colon.
pub fn extract_address(line: &str) -> String {
    if let Some(start) = line.find('<') {
        if let Some(len) = line[start + 1..].find('>') {
            return line[start + 1..start + 1 + len].to_string();
        }
    }

    match line.split_once(':') {
        Some((_, rest)) => rest.trim().to_string(),
        None => String::new()
    }
}

/// Undecodable input yields an empty string, which triggers the fallback
/// credentials.
fn decode_base64(value: &str) -> String {
    match STANDARD.decode(value.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new()
    }
}

/// Rewrites CR, LF and CRLF line endings as CRLF.
pub fn normalize_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut bytes = data.iter().copied().peekable();

    while let Some(b) = bytes.next() {
        match b {
            b'\r' => {
                bytes.next_if_eq(&b'\n');
                out.extend_from_slice(b"\r\n");
            },
            b'\n' => out.extend_from_slice(b"\r\n"),
            _ => out.push(b)
        }
    }

    out
}

fn one_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// AUTH LOGIN arguments are credentials
fn redact(line: &str) -> &str {
    match split_command(line).0.as_str() {
        "AUTH" => "AUTH ...",
        _ => line
    }
}
