//! IMAP mailbox over TLS.
//!
//! Each operation opens its own connection on the blocking pool: LOGIN,
//! SELECT, the actual work, LOGOUT. Messages are addressed by UID, and
//! bodies are fetched with `BODY.PEEK[]` so listing never sets `\Seen`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;

use super::{EmailMessage, Mailbox};
use crate::config::ImapConfig;
use crate::error::MailboxError;
use crate::pipeline::types::Attachment;

/// Largest literal accepted from the server. Fits a 50 MiB attachment after
/// base64 expansion plus the rest of the message.
const MAX_LITERAL_BYTES: usize = 96 * 1024 * 1024;

/// One untagged server response, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// A logged-in (or about to be) IMAP conversation over any byte stream.
struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a stream and consume the server greeting.
    fn start(stream: S) -> Result<Self, MailboxError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        let greeting = String::from_utf8_lossy(&greeting);
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err(MailboxError::Protocol("IMAP connection closed".into()));
        }
        Ok(buf)
    }

    /// Send a tagged command and collect untagged responses until the
    /// tagged completion. Anything but `OK` is a protocol error.
    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let tag_prefix = format!("{tag} ");
        let mut responses = Vec::new();
        loop {
            let line = String::from_utf8_lossy(&self.read_line()?).into_owned();
            if let Some(status) = line.strip_prefix(&tag_prefix) {
                let status = status.trim_end();
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                // Only the verb, so credentials never end up in errors or logs.
                let verb = cmd.split_whitespace().next().unwrap_or_default();
                return Err(MailboxError::Protocol(format!("{verb} failed: {status}")));
            }

            let mut item = Untagged::default();
            let mut current = line;
            while let Some(len) = literal_len(&current) {
                if len > MAX_LITERAL_BYTES {
                    return Err(MailboxError::Protocol(format!(
                        "server literal of {len} bytes exceeds {MAX_LITERAL_BYTES} byte limit"
                    )));
                }
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                item.literals.push(literal);
                item.text.push_str(&current);
                current = String::from_utf8_lossy(&self.read_line()?).into_owned();
            }
            item.text.push_str(&current);
            responses.push(item);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("LOGIN {} {}", quote(username), quote(password)))
            .map(|_| ())
            .map_err(|_| MailboxError::AuthFailed {
                user: username.to_string(),
            })
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.command(&format!("SELECT {}", quote(folder))).map(|_| ())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            tracing::debug!(error = %e, "IMAP logout did not complete cleanly");
        }
    }

    fn search_uids(&mut self, unread_only: bool) -> Result<Vec<u32>, MailboxError> {
        let criteria = if unread_only { "UNSEEN" } else { "ALL" };
        let responses = self.command(&format!("UID SEARCH {criteria}"))?;
        Ok(parse_search_uids(&responses))
    }

    /// Full RFC 822 message for `uid`, or `None` when the server has no such UID.
    fn fetch_message(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailboxError> {
        let responses = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(responses
            .into_iter()
            .filter(|r| r.text.contains("FETCH"))
            .find_map(|r| r.literals.into_iter().next()))
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
            .map(|_| ())
    }
}

/// Byte count of a literal announced at the end of `line` (`... {123}\r\n`).
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn parse_search_uids(responses: &[Untagged]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|uid| uid.parse().ok())
        .collect()
}

/// Quote an IMAP string argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_uid(message_id: &str) -> Result<u32, MailboxError> {
    message_id
        .trim()
        .parse()
        .map_err(|_| MailboxError::MessageNotFound(message_id.to_string()))
}

/// Build message metadata from a raw RFC 822 body. Attachment ids are the
/// attachment's position within the message.
fn parse_message(message_id: &str, raw: &[u8]) -> Option<EmailMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let attachments: Vec<Attachment> = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let content_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let name = MimeHeaders::attachment_name(part)
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{index}"));
            Attachment::new(name, part.contents().len() as u64, content_type)
                .with_id(index.to_string())
        })
        .collect();

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(EmailMessage {
        id: message_id.to_string(),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        sender,
        received_at,
        has_attachments: !attachments.is_empty(),
        attachments,
    })
}

/// Decoded bytes of attachment number `attachment_id` in a raw message.
fn extract_attachment(
    message_id: &str,
    attachment_id: &str,
    raw: &[u8],
) -> Result<Vec<u8>, MailboxError> {
    let not_found = || MailboxError::AttachmentNotFound {
        message_id: message_id.to_string(),
        attachment_id: attachment_id.to_string(),
    };

    let index: usize = attachment_id.trim().parse().map_err(|_| not_found())?;
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailboxError::Protocol(format!("message {message_id} is not valid MIME")))?;
    let part = parsed.attachments().nth(index).ok_or_else(not_found)?;

    let contents = part.contents();
    if contents.is_empty() {
        return Err(MailboxError::EmptyAttachment(attachment_id.to_string()));
    }
    Ok(contents.to_vec())
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// [`Mailbox`] backed by an IMAPS server.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    /// Run `op` inside a fresh logged-in session on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = connect(&config)?;
            session.login(&config.username, config.password.expose_secret())?;
            session.select(&config.folder)?;
            let result = op(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

fn connect(config: &ImapConfig) -> Result<ImapSession<TlsStream>, MailboxError> {
    let connection_err = |reason: String| MailboxError::Connection {
        host: config.host.clone(),
        reason,
    };

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .map_err(|e| connection_err(e.to_string()))?;
    tcp.set_read_timeout(Some(config.timeout))?;
    tcp.set_write_timeout(Some(config.timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| connection_err(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connection_err(e.to_string()))?;

    ImapSession::start(rustls::StreamOwned::new(conn, tcp))
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_recent_messages(
        &self,
        max_count: usize,
        unread_only: bool,
    ) -> Result<Vec<EmailMessage>, MailboxError> {
        let messages = self
            .with_session(move |session| {
                let mut uids = session.search_uids(unread_only)?;
                uids.sort_unstable();

                let mut messages = Vec::new();
                for uid in uids.into_iter().rev().take(max_count) {
                    let Some(raw) = session.fetch_message(uid)? else {
                        continue;
                    };
                    match parse_message(&uid.to_string(), &raw) {
                        Some(message) => messages.push(message),
                        None => tracing::warn!(uid, "Skipping unparsable message"),
                    }
                }
                Ok(messages)
            })
            .await?;

        tracing::info!(
            count = messages.len(),
            unread_only,
            host = %self.config.host,
            "Listed mailbox messages"
        );
        Ok(messages)
    }

    async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailboxError> {
        let uid = parse_uid(message_id)?;
        let message_id = message_id.to_string();
        let attachment_id = attachment_id.to_string();

        self.with_session(move |session| {
            let raw = session
                .fetch_message(uid)?
                .ok_or_else(|| MailboxError::MessageNotFound(message_id.clone()))?;
            extract_attachment(&message_id, &attachment_id, &raw)
        })
        .await
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), MailboxError> {
        let uid = parse_uid(message_id)?;
        self.with_session(move |session| session.mark_seen(uid)).await?;
        tracing::debug!(uid, "Marked message as read");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Scripted server: reads come from `input`, writes are captured.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(script: &[u8]) -> Self {
            Self {
                input: Cursor::new(script.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const RAW_MESSAGE: &str = "From: Billing <billing@acme.test>\r\n\
        To: ap@example.test\r\n\
        Subject: Your invoice\r\n\
        Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
        \r\n\
        --XYZ\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Please find the invoice attached.\r\n\
        --XYZ\r\n\
        Content-Type: application/pdf; name=\"invoice123.pdf\"\r\n\
        Content-Disposition: attachment; filename=\"invoice123.pdf\"\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        JVBERi0xLjQK\r\n\
        --XYZ--\r\n";

    #[test]
    fn literal_length_is_detected() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {1234}\r\n"), Some(1234));
        assert_eq!(literal_len("* 1 FETCH (UID 7 FLAGS ())\r\n"), None);
        assert_eq!(literal_len("{abc}\r\n"), None);
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote("pa\"ss\\word"), "\"pa\\\"ss\\\\word\"");
    }

    #[test]
    fn command_reads_literals_byte_exactly() {
        let script = b"* OK IMAP ready\r\n\
            * 1 FETCH (UID 7 BODY[] {6}\r\nab\r\ncd)\r\n\
            A1 OK FETCH completed\r\n";
        let mut session = ImapSession::start(ScriptedStream::new(script)).unwrap();

        let responses = session.command("UID FETCH 7 BODY.PEEK[]").unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].literals, vec![b"ab\r\ncd".to_vec()]);
        assert!(responses[0].text.ends_with(")\r\n"));
        assert_eq!(
            session.stream.get_ref().output,
            b"A1 UID FETCH 7 BODY.PEEK[]\r\n".to_vec()
        );
    }

    #[test]
    fn oversized_literal_is_refused_before_allocation() {
        let script = format!(
            "* OK IMAP ready\r\n* 1 FETCH (UID 7 BODY[] {{{}}}\r\n",
            MAX_LITERAL_BYTES + 1
        );
        let mut session = ImapSession::start(ScriptedStream::new(script.as_bytes())).unwrap();

        let err = session.command("UID FETCH 7 BODY.PEEK[]").unwrap_err();
        assert!(matches!(err, MailboxError::Protocol(ref m) if m.contains("exceeds")));
    }

    #[test]
    fn failed_command_hides_arguments() {
        let script = b"* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] nope\r\n";
        let mut session = ImapSession::start(ScriptedStream::new(script)).unwrap();

        let err = session.command("LOGIN \"bob\" \"hunter2\"").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("LOGIN failed"));
        assert!(!message.contains("hunter2"));
    }

    #[test]
    fn login_failure_is_auth_error() {
        let script = b"* OK ready\r\nA1 NO bad credentials\r\n";
        let mut session = ImapSession::start(ScriptedStream::new(script)).unwrap();
        assert!(matches!(
            session.login("bob", "secret"),
            Err(MailboxError::AuthFailed { .. })
        ));
    }

    #[test]
    fn search_collects_uids() {
        let script = b"* OK ready\r\n* SEARCH 3 9 12\r\nA1 OK SEARCH completed\r\n";
        let mut session = ImapSession::start(ScriptedStream::new(script)).unwrap();
        assert_eq!(session.search_uids(true).unwrap(), vec![3, 9, 12]);
        assert_eq!(
            session.stream.get_ref().output,
            b"A1 UID SEARCH UNSEEN\r\n".to_vec()
        );
    }

    #[test]
    fn bad_greeting_is_rejected() {
        assert!(ImapSession::start(ScriptedStream::new(b"* BYE go away\r\n")).is_err());
    }

    #[test]
    fn message_metadata_is_parsed() {
        let message = parse_message("42", RAW_MESSAGE.as_bytes()).unwrap();
        assert_eq!(message.id, "42");
        assert_eq!(message.subject, "Your invoice");
        assert_eq!(message.sender, "billing@acme.test");
        assert!(message.has_attachments);
        assert_eq!(message.attachments.len(), 1);

        let attachment = &message.attachments[0];
        assert_eq!(attachment.name, "invoice123.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.attachment_id.as_deref(), Some("0"));
        assert_eq!(attachment.size, 9);
    }

    #[test]
    fn attachment_bytes_are_decoded() {
        let bytes = extract_attachment("42", "0", RAW_MESSAGE.as_bytes()).unwrap();
        assert_eq!(bytes, b"%PDF-1.4\n");
    }

    #[test]
    fn unknown_attachment_index_is_not_found() {
        assert!(matches!(
            extract_attachment("42", "5", RAW_MESSAGE.as_bytes()),
            Err(MailboxError::AttachmentNotFound { .. })
        ));
        assert!(matches!(
            extract_attachment("42", "abc", RAW_MESSAGE.as_bytes()),
            Err(MailboxError::AttachmentNotFound { .. })
        ));
    }

    #[test]
    fn non_numeric_message_id_is_not_found() {
        assert!(matches!(
            parse_uid("<abc@host>"),
            Err(MailboxError::MessageNotFound(_))
        ));
    }
}
