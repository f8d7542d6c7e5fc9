//! Fetch, decode, extract and deliver a batch of recent messages.
//!
//! A batch covers the last `min(count, total)` messages of the mailbox by
//! sequence number. Each message is decoded into its leaf MIME parts; text parts
//! are run through the [`Extractor`] in order until one yields a result, which is
//! handed to the [`Delivery`]. Undecodable messages and parts are reported and
//! skipped. Only a transport failure aborts the batch.

use crate::dispatcher::Delivery;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};
use crate::extractor::{Extraction, Extractor};
use crate::session::{Connection, RawMessage};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use mailparse::{parse_mail, DispositionType, ParsedMail};
use tracing::{debug, instrument, warn};

/// An inclusive range of message sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    /// First sequence number.
    pub from: u32,
    /// Last sequence number.
    pub to: u32,
}

impl SequenceRange {
    /// The range covering the newest `min(count, total)` messages.
    ///
    /// Returns `None` for an empty mailbox or a zero count.
    ///
    /// ```
    /// use email_dispatch::pipeline::SequenceRange;
    ///
    /// assert_eq!(SequenceRange::recent(3, 5), Some(SequenceRange { from: 1, to: 3 }));
    /// assert_eq!(SequenceRange::recent(40, 5), Some(SequenceRange { from: 36, to: 40 }));
    /// assert_eq!(SequenceRange::recent(0, 5), None);
    /// ```
    #[must_use]
    pub fn recent(total: u32, count: u32) -> Option<Self> {
        if total == 0 || count == 0 {
            return None;
        }
        Some(Self {
            from: total.saturating_sub(count) + 1,
            to: total,
        })
    }

    /// Number of messages in the range.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.to - self.from + 1
    }

    /// Always `false`; ranges hold at least one message.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

/// One leaf MIME part of a message.
#[derive(Debug)]
pub enum MessagePart {
    /// Displayable text (plain or HTML), fully decoded.
    Inline {
        /// MIME type, lowercased.
        mimetype: String,
        /// Decoded text.
        text: String,
    },
    /// Named or non-text content. Not decoded.
    Attachment {
        /// File name from the disposition or content type, if any.
        filename: Option<String>,
        /// MIME type, lowercased.
        mimetype: String,
    },
    /// A text part whose content could not be decoded.
    Unreadable(Error),
}

/// A message split into its leaf parts, in document order.
#[derive(Debug)]
pub struct DecodedMessage {
    /// Sequence number within the mailbox.
    pub seq: u32,
    /// Leaf parts.
    pub parts: Vec<MessagePart>,
}

/// One item of a fetched batch.
#[derive(Debug)]
pub enum FetchedMessage {
    /// The message parsed.
    Decoded(DecodedMessage),
    /// The message has no body or is not valid MIME.
    Undecodable {
        /// Sequence number within the mailbox.
        seq: u32,
        /// What went wrong.
        error: Error,
    },
}

/// Decodes one raw message into its leaf parts.
pub fn decode_message(raw: &RawMessage) -> FetchedMessage {
    let seq = raw.seq;

    let Some(body) = raw.body.as_deref() else {
        return FetchedMessage::Undecodable {
            seq,
            error: Error::MissingBody { seq },
        };
    };

    match parse_mail(body) {
        Ok(parsed) => {
            let mut parts = Vec::new();
            collect_parts(&parsed, &mut parts);
            FetchedMessage::Decoded(DecodedMessage { seq, parts })
        }
        Err(source) => FetchedMessage::Undecodable {
            seq,
            error: Error::ParseEmail { seq, source },
        },
    }
}

/// Walks the MIME tree depth-first, collecting leaves.
fn collect_parts(mail: &ParsedMail<'_>, parts: &mut Vec<MessagePart>) {
    if !mail.subparts.is_empty() {
        for part in &mail.subparts {
            collect_parts(part, parts);
        }
        return;
    }

    let mimetype = mail.ctype.mimetype.to_lowercase();
    let disposition = mail.get_content_disposition();

    if disposition.disposition == DispositionType::Attachment || !mimetype.starts_with("text/") {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| mail.ctype.params.get("name"))
            .cloned();
        parts.push(MessagePart::Attachment { filename, mimetype });
        return;
    }

    match mail.get_body() {
        Ok(text) => parts.push(MessagePart::Inline { mimetype, text }),
        Err(source) => parts.push(MessagePart::Unreadable(Error::DecodePart {
            mimetype,
            source,
        })),
    }
}

/// Lazily fetches and decodes the newest `min(count, total)` messages.
///
/// The stream is finite and cannot be restarted. An `Err` item is a transport
/// failure; decode problems arrive as [`FetchedMessage::Undecodable`].
///
/// # Errors
///
/// Returns an error if the fetch command itself fails.
pub async fn fetch_recent(
    connection: &mut dyn Connection,
    total: u32,
    count: u32,
) -> Result<BoxStream<'_, Result<FetchedMessage>>> {
    let Some(range) = SequenceRange::recent(total, count) else {
        return Ok(stream::empty().boxed());
    };

    let raw = connection.fetch(range).await?;
    Ok(raw.map(|item| item.map(|raw| decode_message(&raw))).boxed())
}

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Messages received from the server.
    pub messages: u32,
    /// Messages that could not be decoded.
    pub undecodable: u32,
    /// Messages where no text part produced a result.
    pub unmatched: u32,
    /// Results accepted by the endpoint.
    pub delivered: u32,
    /// Results the endpoint rejected or never received.
    pub failed: u32,
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} messages, {} undecodable, {} unmatched, {} delivered, {} failed",
            self.messages, self.undecodable, self.unmatched, self.delivered, self.failed
        )
    }
}

/// Fetches the newest messages and runs each through extraction and delivery.
///
/// # Errors
///
/// Returns an error only for transport failures; the caller should reconnect.
#[instrument(name = "pipeline::process_batch", skip_all, fields(total = total, count = count))]
pub async fn process_batch(
    connection: &mut dyn Connection,
    total: u32,
    count: u32,
    extractor: &Extractor,
    delivery: &dyn Delivery,
    events: &EventSink,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();

    match SequenceRange::recent(total, count) {
        Some(range) => events.emit(EventKind::Fetch, format!("Fetching messages {range}")),
        None => {
            events.emit(EventKind::Fetch, "Mailbox is empty, nothing to fetch");
            return Ok(summary);
        }
    }

    let mut messages = fetch_recent(connection, total, count).await?;

    while let Some(item) = messages.next().await {
        summary.messages += 1;
        match item? {
            FetchedMessage::Undecodable { seq, error } => {
                warn!(seq, error = %error, "Skipping undecodable message");
                events.emit(EventKind::Fetch, format!("Message {seq}: {error}"));
                summary.undecodable += 1;
            }
            FetchedMessage::Decoded(message) => {
                match process_message(&message, extractor, delivery, events).await {
                    MessageOutcome::Unmatched => summary.unmatched += 1,
                    MessageOutcome::Delivered => summary.delivered += 1,
                    MessageOutcome::Failed => summary.failed += 1,
                }
            }
        }
    }

    events.emit(EventKind::Fetch, format!("Batch done: {summary}"));
    Ok(summary)
}

enum MessageOutcome {
    Unmatched,
    Delivered,
    Failed,
}

/// Scans parts in order and delivers the first non-vetoed extraction.
async fn process_message(
    message: &DecodedMessage,
    extractor: &Extractor,
    delivery: &dyn Delivery,
    events: &EventSink,
) -> MessageOutcome {
    let seq = message.seq;

    for part in &message.parts {
        match part {
            MessagePart::Attachment { filename, mimetype } => {
                let name = filename.as_deref().unwrap_or("<unnamed>");
                events.emit(
                    EventKind::Fetch,
                    format!("Got attachment: {name} ({mimetype})"),
                );
            }
            MessagePart::Unreadable(error) => {
                warn!(seq, error = %error, "Skipping unreadable part");
                events.emit(EventKind::Fetch, format!("Message {seq}: {error}"));
            }
            MessagePart::Inline { mimetype, text } => match extractor.extract(text) {
                Extraction::Vetoed { rule } => {
                    debug!(seq, %mimetype, %rule, "Part vetoed");
                    events.emit(
                        EventKind::Extract,
                        format!("Message {seq} {mimetype} part: required '{rule}' not found"),
                    );
                }
                Extraction::Extracted(result) => {
                    events.emit(
                        EventKind::Extract,
                        format!("Message {seq} extracted: {result}"),
                    );
                    let outcome = delivery.deliver(&result).await;
                    events.emit(EventKind::Delivery, format!("Message {seq} {outcome}"));
                    return if outcome.is_success() {
                        MessageOutcome::Delivered
                    } else {
                        MessageOutcome::Failed
                    };
                }
            },
        }
    }

    MessageOutcome::Unmatched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seq: u32, body: &[u8]) -> RawMessage {
        RawMessage {
            seq,
            body: Some(body.to_vec()),
        }
    }

    fn decoded(message: FetchedMessage) -> DecodedMessage {
        match message {
            FetchedMessage::Decoded(message) => message,
            FetchedMessage::Undecodable { error, .. } => panic!("undecodable: {error}"),
        }
    }

    #[test]
    fn test_recent_range_covers_newest() {
        for total in 1..=20u32 {
            for count in 1..=8u32 {
                let range = SequenceRange::recent(total, count).unwrap();
                assert_eq!(range.len(), count.min(total));
                assert_eq!(range.to, total);
            }
        }
    }

    #[test]
    fn test_recent_range_small_mailbox() {
        let range = SequenceRange::recent(3, 5).unwrap();
        assert_eq!(range, SequenceRange { from: 1, to: 3 });
        assert_eq!(range.to_string(), "1:3");
    }

    #[test]
    fn test_recent_range_empty() {
        assert_eq!(SequenceRange::recent(0, 5), None);
        assert_eq!(SequenceRange::recent(5, 0), None);
    }

    #[test]
    fn test_decode_simple_message() {
        let message = decoded(decode_message(&raw(
            1,
            b"From: test@example.com\r\nTo: user@example.com\r\n\r\nYour code is 123456.",
        )));

        assert_eq!(message.parts.len(), 1);
        assert!(matches!(
            &message.parts[0],
            MessagePart::Inline { mimetype, text } if mimetype == "text/plain" && text.contains("123456")
        ));
    }

    #[test]
    fn test_decode_multipart_with_attachment() {
        let body = b"From: test@example.com\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
code 111111\r\n\
--XX\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>code 222222</b>\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--XX--\r\n";

        let message = decoded(decode_message(&raw(7, body)));
        assert_eq!(message.seq, 7);
        assert_eq!(message.parts.len(), 3);
        assert!(matches!(&message.parts[0], MessagePart::Inline { mimetype, .. } if mimetype == "text/plain"));
        assert!(matches!(&message.parts[1], MessagePart::Inline { mimetype, .. } if mimetype == "text/html"));
        assert!(matches!(
            &message.parts[2],
            MessagePart::Attachment { filename: Some(name), .. } if name == "invoice.pdf"
        ));
    }

    #[test]
    fn test_decode_text_attachment_is_not_inline() {
        let body = b"Content-Type: multipart/mixed; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
123456\r\n\
--B--\r\n";

        let message = decoded(decode_message(&raw(2, body)));
        assert!(matches!(
            &message.parts[..],
            [MessagePart::Attachment { filename: Some(name), .. }] if name == "notes.txt"
        ));
    }

    #[test]
    fn test_decode_missing_body() {
        let message = decode_message(&RawMessage { seq: 4, body: None });
        assert!(matches!(
            message,
            FetchedMessage::Undecodable {
                seq: 4,
                error: Error::MissingBody { seq: 4 }
            }
        ));
    }

    #[test]
    fn test_summary_display() {
        let summary = BatchSummary {
            messages: 3,
            undecodable: 1,
            unmatched: 1,
            delivered: 1,
            failed: 0,
        };
        assert_eq!(
            summary.to_string(),
            "3 messages, 1 undecodable, 1 unmatched, 1 delivered, 0 failed"
        );
    }
}
