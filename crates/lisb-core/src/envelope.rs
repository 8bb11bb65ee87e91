//! Inbound message snapshot
//!
//! An [`Envelope`] bundles the SMTP envelope (peer, MAIL FROM, RCPT TO) with
//! the raw RFC 5322 message and the header facts the filters look at. All
//! derived facts are computed once on construction; the value never changes
//! afterwards, so it can be shared freely between concurrent filter tasks.

use mail_parser::{MessageParser, MimeHeaders};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// One inbound message plus its protocol metadata
#[derive(Debug, Clone)]
pub struct Envelope {
    peer: IpAddr,
    mail_from: String,
    rcpt_tos: Vec<String>,
    raw: Vec<u8>,
    headers: Vec<(String, String)>,
    parsed_from: Option<String>,
    parsed_to: Option<Vec<String>>,
    parsed_return_path: Option<String>,
    parsed_reply_to: Option<String>,
    sender_domain: Option<String>,
    dkim_params: BTreeMap<String, String>,
    x_headers: BTreeSet<String>,
    parts: Vec<PartInfo>,
    body_text: String,
}

/// Summary of a MIME part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// `type/subtype`, lowercase
    pub content_type: String,
    /// File name, when the part is an attachment
    pub attachment_name: Option<String>,
}

impl Envelope {
    /// Build an envelope from what the SMTP layer handed over
    pub fn new(
        peer: IpAddr,
        mail_from: impl Into<String>,
        rcpt_tos: Vec<String>,
        raw: impl Into<Vec<u8>>,
    ) -> Self {
        let raw = raw.into();
        let mut headers = Vec::new();
        let mut parts = Vec::new();
        let mut body_text = String::new();

        if let Some(message) = MessageParser::default().parse(&raw[..]) {
            for header in message.headers() {
                let start = header.offset_start as usize;
                let end = (header.offset_end as usize).min(raw.len());
                let value = raw
                    .get(start..end)
                    .map(|bytes| unfold(&String::from_utf8_lossy(bytes)))
                    .unwrap_or_default();
                headers.push((header.name.as_str().to_string(), value));
            }

            for part in &message.parts {
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "text/plain".to_string())
                    .to_lowercase();
                let attachment_name = part
                    .content_disposition()
                    .and(part.attachment_name())
                    .map(str::to_string);
                parts.push(PartInfo {
                    content_type,
                    attachment_name,
                });
            }

            // A plain-only message lists the same part as both text and HTML body
            let body_ids: BTreeSet<usize> = message
                .text_body
                .iter()
                .chain(message.html_body.iter())
                .copied()
                .collect();
            for text in body_ids
                .into_iter()
                .filter_map(|id| message.parts.get(id))
                .filter_map(|part| part.text_contents())
            {
                body_text.push_str(text);
                body_text.push('\n');
            }
        }

        let header = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        let parsed_from = header("From").and_then(parse_email_address);
        let parsed_to = header("To").map(|value| {
            split_address_list(value)
                .into_iter()
                .filter_map(parse_email_address)
                .collect()
        });
        let parsed_return_path = header("Return-Path").and_then(parse_email_address);
        let parsed_reply_to = header("Reply-To").and_then(parse_email_address);
        let dkim_params = header("DKIM-Signature")
            .map(parse_tag_list)
            .unwrap_or_default();

        let sender_domain = parsed_from.as_deref().and_then(|from| {
            let mut pieces = from.split('@');
            match (pieces.next(), pieces.next(), pieces.next()) {
                (Some(_), Some(domain), None) if !domain.is_empty() => {
                    Some(domain.to_lowercase())
                }
                _ => None,
            }
        });

        let x_headers = headers
            .iter()
            .filter(|(name, _)| {
                name.len() > 2
                    && name
                        .get(..2)
                        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("x-"))
            })
            .map(|(name, _)| name.clone())
            .collect();

        Self {
            peer,
            mail_from: mail_from.into(),
            rcpt_tos,
            raw,
            headers,
            parsed_from,
            parsed_to,
            parsed_return_path,
            parsed_reply_to,
            sender_domain,
            dkim_params,
            x_headers,
            parts,
            body_text,
        }
    }

    /// Connecting peer
    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    /// SMTP MAIL FROM
    pub fn mail_from(&self) -> &str {
        &self.mail_from
    }

    /// SMTP RCPT TO, in arrival order
    pub fn rcpt_tos(&self) -> &[String] {
        &self.rcpt_tos
    }

    /// The message as received
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// First value of a header, unfolded
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Address of the `From` header
    pub fn parsed_from(&self) -> Option<&str> {
        self.parsed_from.as_deref()
    }

    /// Addresses of the `To` header; `None` when the header is missing
    pub fn parsed_to(&self) -> Option<&[String]> {
        self.parsed_to.as_deref()
    }

    /// Address of the `Return-Path` header
    pub fn parsed_return_path(&self) -> Option<&str> {
        self.parsed_return_path.as_deref()
    }

    /// Address of the `Reply-To` header
    pub fn parsed_reply_to(&self) -> Option<&str> {
        self.parsed_reply_to.as_deref()
    }

    /// Domain of the `From` address, lowercase
    pub fn sender_domain(&self) -> Option<&str> {
        self.sender_domain.as_deref()
    }

    /// Tags of the `DKIM-Signature` header
    pub fn dkim_params(&self) -> &BTreeMap<String, String> {
        &self.dkim_params
    }

    /// Names of all `X-` headers
    pub fn x_headers(&self) -> &BTreeSet<String> {
        &self.x_headers
    }

    /// MIME parts of the message
    pub fn parts(&self) -> &[PartInfo] {
        &self.parts
    }

    /// Concatenated text and HTML bodies
    pub fn body_text(&self) -> &str {
        &self.body_text
    }
}

/// Reduce an address header to the bare address.
///
/// `"Jane" <jane@example.com>` and `jane@example.com` both give
/// `jane@example.com`; values without `@` give `None`.
pub fn parse_email_address(value: &str) -> Option<String> {
    if !value.contains('@') {
        return None;
    }

    let address = match value.rsplit_once('<') {
        Some((_, rest)) => rest.split('>').next().unwrap_or(rest),
        None => value,
    }
    .trim();

    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

/// Split an address list on commas that are not inside quotes or brackets
fn split_address_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&value[start..]);

    items
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

/// Parse a `tag=value; tag=value` list such as a DKIM signature
fn parse_tag_list(value: &str) -> BTreeMap<String, String> {
    value
        .split(';')
        .filter_map(|tag| tag.split_once('='))
        .map(|(name, value)| {
            let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            (name.trim().to_string(), value)
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Undo header folding and strip the line terminator
fn unfold(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
