//! Upstream relay

use super::ForwardJob;
use async_trait::async_trait;
use lettre::address::{Address, Envelope as SmtpEnvelope};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use lisb_common::config::ForwardingConfig;
use lisb_common::{Error, Result};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Destination of accepted messages
#[async_trait]
pub trait Relay: Send + Sync {
    /// Hand `job` to the relay.
    ///
    /// Transient errors (see [`Error::is_transient`]) make the forwarder retry.
    async fn deliver(&self, job: &ForwardJob) -> Result<()>;

    /// Forget any connection state after a failure
    async fn reset(&self) {}
}

/// Plain SMTP relay, as used by a local MTA on the same host or network
pub struct SmtpRelay {
    host: String,
    port: u16,
    timeout: Duration,
    transport: Mutex<Option<AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpRelay {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            transport: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ForwardingConfig) -> Self {
        Self::new(
            config.remote_ip.clone(),
            config.remote_port,
            config.relay_timeout(),
        )
    }

    /// Pooled transport to the relay, created on first use.
    ///
    /// Clones share the pool, so connections survive between deliveries.
    fn transport(&self) -> AsyncSmtpTransport<Tokio1Executor> {
        let mut transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        transport
            .get_or_insert_with(|| {
                debug!("Opening relay transport to {}:{}", self.host, self.port);
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
                    .port(self.port)
                    .timeout(Some(self.timeout))
                    .build()
            })
            .clone()
    }
}

/// SMTP envelope of a job; the null sender maps to `None`
fn smtp_envelope(job: &ForwardJob) -> Result<SmtpEnvelope> {
    let from = match job.from.trim() {
        "" | "<>" => None,
        from => Some(
            from.parse::<Address>()
                .map_err(|e| Error::Validation(format!("Invalid sender {}: {}", from, e)))?,
        ),
    };

    let to = job
        .to
        .iter()
        .map(|rcpt| {
            rcpt.parse::<Address>()
                .map_err(|e| Error::Validation(format!("Invalid recipient {}: {}", rcpt, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    SmtpEnvelope::new(from, to).map_err(|e| Error::Validation(e.to_string()))
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn deliver(&self, job: &ForwardJob) -> Result<()> {
        let envelope = smtp_envelope(job)?;
        let transport = self.transport();

        match tokio::time::timeout(self.timeout, transport.send_raw(&envelope, &job.message)).await
        {
            Ok(Ok(response)) => {
                debug!("Relay accepted {}: {}", job.id, response.code());
                Ok(())
            }
            Ok(Err(e)) if e.is_permanent() => Err(Error::Rejected(e.to_string())),
            Ok(Err(e)) => Err(Error::Forwarding(e.to_string())),
            Err(_) => Err(Error::Forwarding(format!(
                "Relay did not answer within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn reset(&self) {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn job(from: &str, to: &[&str]) -> ForwardJob {
        ForwardJob::new(
            from,
            to.iter().map(|s| s.to_string()).collect(),
            b"Subject: x\r\n\r\nbody".to_vec(),
        )
    }

    #[test]
    fn test_smtp_envelope() {
        let envelope = smtp_envelope(&job("a@x.com", &["b@y.com", "c@y.com"])).unwrap();
        assert_eq!(envelope.from().map(|a| a.to_string()), Some("a@x.com".to_string()));
        assert_eq!(envelope.to().len(), 2);
    }

    #[test]
    fn test_null_sender_is_allowed() {
        let envelope = smtp_envelope(&job("<>", &["b@y.com"])).unwrap();
        assert!(envelope.from().is_none());
    }

    #[test]
    fn test_invalid_addresses_are_permanent() {
        let err = smtp_envelope(&job("a@x.com", &["not an address"])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!err.is_transient());

        assert!(smtp_envelope(&job("a@x.com", &[])).is_err());
    }

    /// Minimal SMTP relay counting the connections it accepts
    async fn counting_relay() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_smtp(stream));
            }
        });

        (port, connections)
    }

    async fn serve_smtp(stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(b"220 relay.test ESMTP\r\n").await.unwrap();

        let mut in_data = false;
        while let Ok(Some(line)) = lines.next_line().await {
            let reply: &[u8] = if in_data {
                if line != "." {
                    continue;
                }
                in_data = false;
                b"250 queued\r\n"
            } else {
                match line.get(..4).map(str::to_ascii_uppercase).as_deref() {
                    Some("EHLO") | Some("HELO") => b"250 relay.test\r\n",
                    Some("DATA") => {
                        in_data = true;
                        b"354 go ahead\r\n"
                    }
                    Some("QUIT") => {
                        let _ = writer.write_all(b"221 bye\r\n").await;
                        return;
                    }
                    _ => b"250 OK\r\n",
                }
            };
            if writer.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_transport_reuses_connection_until_reset() {
        let (port, connections) = counting_relay().await;
        let relay = SmtpRelay::new("127.0.0.1", port, Duration::from_secs(5));

        relay.deliver(&job("a@x.com", &["b@y.com"])).await.unwrap();
        relay.deliver(&job("a@x.com", &["c@y.com"])).await.unwrap();
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        relay.reset().await;
        relay.deliver(&job("a@x.com", &["b@y.com"])).await.unwrap();
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transient() {
        // Nothing listens on the discard port of the loopback interface
        let relay = SmtpRelay::new("127.0.0.1", 9, Duration::from_secs(2));
        let err = relay.deliver(&job("a@x.com", &["b@y.com"])).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
        relay.reset().await;
    }
}
