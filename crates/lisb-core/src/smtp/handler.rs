//! SMTP session handler

use crate::envelope::Envelope;
use crate::filtering::FilteringManager;
use crate::queue::{ForwardJob, ForwardQueue};
use anyhow::Result;
use lisb_common::config::ServerConfig;
use lisb_common::Verdict;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reply to a message judged as spam
pub const REJECTION_REPLY: &str = "Requested mail action not taken: mailbox unavailable \
    (e.g., mailbox busy or temporarily blocked for policy reasons)";

/// Reply while the gateway is shutting down
pub const SHUTDOWN_REPLY: &str = "Service not available, closing transmission channel";

/// Longest command line accepted, CRLF included (RFC 5321 §4.5.3.1.4)
const MAX_COMMAND_LINE: usize = 512;

/// Longest message text line accepted, CRLF included (RFC 5321 §4.5.3.1.6)
const MAX_TEXT_LINE: usize = 1000;

/// SMTP session state
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// Transaction being assembled
#[derive(Debug, Default)]
struct Transaction {
    mail_from: Option<String>,
    rcpt_tos: Vec<String>,
}

/// What a DATA phase produced
#[derive(Debug, PartialEq)]
enum MessageData {
    Complete(Vec<u8>),
    TooLarge,
    LineTooLong,
}

impl Transaction {
    fn clear(&mut self) {
        self.mail_from = None;
        self.rcpt_tos.clear();
    }
}

/// SMTP session handler
pub struct SmtpHandler {
    config: ServerConfig,
    filtering: Arc<FilteringManager>,
    queue: ForwardQueue,
    shutdown: CancellationToken,
    peer_addr: SocketAddr,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(
        config: ServerConfig,
        filtering: Arc<FilteringManager>,
        queue: ForwardQueue,
        shutdown: CancellationToken,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            config,
            filtering,
            queue,
            shutdown,
            peer_addr,
        }
    }

    /// Handle an SMTP session
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Connected;
        let mut transaction = Transaction::default();

        if self.shutdown.is_cancelled() {
            self.send_response(&mut writer, 421, SHUTDOWN_REPLY).await?;
            return Ok(());
        }

        // Send greeting
        self.send_response(&mut writer, 220, &format!("{} ESMTP LiSB", self.config.hostname))
            .await?;

        let mut buf = Vec::new();

        loop {
            buf.clear();
            let (bytes_read, overrun) = tokio::select! {
                read = read_line_capped(&mut reader, &mut buf, MAX_COMMAND_LINE) => read?,
                _ = self.shutdown.cancelled() => {
                    self.send_response(&mut writer, 421, SHUTDOWN_REPLY).await?;
                    break;
                }
            };

            if bytes_read == 0 {
                debug!("Client {} disconnected", self.peer_addr);
                break;
            }

            if overrun {
                warn!("Overlong command line from {}", self.peer_addr);
                self.send_response(&mut writer, 500, "Line too long").await?;
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer_addr, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    transaction.clear();
                    state = SessionState::Greeted;
                    self.send_response(&mut writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    transaction.clear();
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.config.hostname, args),
                        format!("SIZE {}", self.config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                    ];

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    // Parse MAIL FROM:<address>
                    if let Some(from_addr) = parse_mail_from(args) {
                        transaction.mail_from = Some(from_addr);
                        state = SessionState::MailFrom;
                        self.send_response(&mut writer, 250, "OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "Bad sender address syntax")
                            .await?;
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    // Parse RCPT TO:<address>
                    if let Some(to_addr) = parse_rcpt_to(args) {
                        transaction.rcpt_tos.push(to_addr);
                        state = SessionState::RcptTo;
                        self.send_response(&mut writer, 250, "OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "Bad recipient address syntax")
                            .await?;
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let (code, reply) = match self.read_data(&mut reader).await? {
                        MessageData::Complete(data) => {
                            self.process_message(&mut transaction, data).await
                        }
                        MessageData::TooLarge => {
                            warn!("Message from {} exceeds the size limit", self.peer_addr);
                            (552, "Message size exceeds fixed maximum message size")
                        }
                        MessageData::LineTooLong => {
                            warn!("Message from {} has an overlong line", self.peer_addr);
                            (500, "Line too long")
                        }
                    };
                    self.send_response(&mut writer, code, reply).await?;

                    // Reset state for next message
                    state = SessionState::Greeted;
                    transaction.clear();

                    if code == 421 {
                        break;
                    }
                }

                "RSET" => {
                    transaction.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "Bye").await?;
                    break;
                }

                _ => {
                    self.send_response(&mut writer, 500, "Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Read message data until <CRLF>.<CRLF>.
    ///
    /// A message over the size limit or with an overlong line is read to
    /// its end and discarded.
    async fn read_data<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<MessageData> {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut refused = None;

        loop {
            line.clear();
            let (bytes_read, overrun) = read_line_capped(reader, &mut line, MAX_TEXT_LINE).await?;

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("Connection closed during DATA"));
            }

            // Lines are whole, so the terminator can only match at a line start
            if !overrun && (line == b".\r\n" || line == b".\n") {
                break;
            }

            if overrun && refused.is_none() {
                refused = Some(MessageData::LineTooLong);
                data = Vec::new();
            }
            if refused.is_some() {
                continue;
            }

            // Dot-stuffing: remove leading dot if followed by another dot
            let line_bytes = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };

            data.extend_from_slice(line_bytes);

            if data.len() > self.config.max_message_size {
                refused = Some(MessageData::TooLarge);
                data = Vec::new();
            }
        }

        Ok(refused.unwrap_or(MessageData::Complete(data)))
    }

    /// Decide on a received message and hand ham to the forwarder
    async fn process_message(
        &self,
        transaction: &mut Transaction,
        data: Vec<u8>,
    ) -> (u16, &'static str) {
        if self.shutdown.is_cancelled() {
            return (421, SHUTDOWN_REPLY);
        }

        info!("A new message has been received from {}", self.peer_addr);

        let envelope = Arc::new(Envelope::new(
            self.peer_addr.ip(),
            transaction.mail_from.take().unwrap_or_default(),
            std::mem::take(&mut transaction.rcpt_tos),
            data,
        ));

        match self.filtering.decide(envelope.clone()).await {
            Verdict::Spam => {
                warn!(
                    "Email from '{}' sent from peer {} was detected as spam, rejecting",
                    envelope.mail_from(),
                    self.peer_addr
                );
                (450, REJECTION_REPLY)
            }
            Verdict::Ham => {
                let job = ForwardJob::from_envelope(&envelope);
                info!("Message {} accepted for {:?}", job.id, job.to);
                self.queue.enqueue(job);
                (250, "OK")
            }
        }
    }

    /// Send an SMTP response
    async fn send_response<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }
}

/// Read one line into `buf`, keeping at most `limit` octets of it.
///
/// Returns the octets consumed and whether the line overran `limit`. The
/// rest of an overlong line is consumed and dropped.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<(usize, bool)> {
    let mut consumed = 0;
    let mut overrun = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }

        let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };

        let room = limit.saturating_sub(buf.len());
        if chunk.len() > room {
            overrun = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = chunk.len();
        reader.consume(used);
        consumed += used;

        if complete {
            break;
        }
    }

    Ok((consumed, overrun))
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args),
        None => (line, ""),
    }
}

/// Address inside a `FROM:`/`TO:` argument, without brackets or ESMTP parameters
fn path_argument<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let args = args.trim();
    let prefix = args.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }

    let addr_part = args[keyword.len()..].trim();

    // Extract address from angle brackets
    if let Some(rest) = addr_part.strip_prefix('<') {
        let end = rest.find('>')?;
        Some(&rest[..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

fn is_mailbox(address: &str) -> bool {
    matches!(address.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty())
}

/// Parse MAIL FROM:<address>; the null sender yields an empty address
fn parse_mail_from(args: &str) -> Option<String> {
    match path_argument(args, "FROM:") {
        Some("") => Some(String::new()),
        Some(address) if is_mailbox(address) => Some(address.to_string()),
        _ => None,
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<String> {
    path_argument(args, "TO:")
        .filter(|address| is_mailbox(address))
        .map(str::to_string)
}
