use base64::{engine::general_purpose::STANDARD, Engine};
use encoding_rs::Encoding;
use log::{trace, warn};
use mailparse::body::Body;
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use quoted_printable::ParseMode;

use crate::error::{DecodeError, TransferError};

const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// The parts of a submitted message that the Graph API needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<Attachment>,
}

/// Decodes a CRLF-normalized DATA payload.
///
/// Only the top-level framing and a non-multipart body are fatal. Inside a
/// multipart message, a part that cannot be decoded is logged and skipped.
pub fn decode_message(raw: &[u8]) -> Result<DecodedMessage, DecodeError> {

    let mail = parse_mail(raw)?;

    // mailparse leaves undecodable encoded-words as they appear on the wire
    let subject = mail.headers.get_first_value("Subject").unwrap_or_default();
    let content_type = mail.headers.get_first_value("Content-Type").unwrap_or_default();

    let mut msg = DecodedMessage {
        subject,
        is_html: is_html_type(&content_type),
        ..Default::default()
    };

    if is_multipart(&mail) {
        collect_parts(&mail, &mut msg);
    } else {
        let content = decode_transfer(&transfer_encoding(&mail), &encoded_body(&mail))?;
        msg.body = decode_text(&mail, &content);
    }

    trace!("Decoded message: subject={:?} html={} body-len={} attachments={}",
        msg.subject, msg.is_html, msg.body.len(), msg.attachments.len());

    Ok(msg)
}

/// Undoes a Content-Transfer-Encoding. Unknown encodings pass through.
pub fn decode_transfer(encoding: &str, data: &[u8]) -> Result<Vec<u8>, TransferError> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: Vec<u8> = data
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();

            Ok(STANDARD.decode(compact)?)
        },
        "quoted-printable" => Ok(quoted_printable::decode(data, ParseMode::Robust)?),
        _ => Ok(data.to_vec()),
    }
}

fn collect_parts(mail: &ParsedMail, msg: &mut DecodedMessage) {
    for part in &mail.subparts {
        let disposition = part.headers
            .get_first_value("Content-Disposition")
            .unwrap_or_default();

        if disposition.trim_start().to_ascii_lowercase().starts_with("attachment") {
            if let Some(attachment) = extract_attachment(part) {
                msg.attachments.push(attachment);
            }
        } else if is_multipart(part) {
            collect_parts(part, msg);
        } else {
            let content = match decode_transfer(&transfer_encoding(part), &part_body(part)) {
                Ok(content) => content,
                Err(err) => {
                    warn!("Failed to decode body part, skipping: {err}");
                    continue;
                }
            };

            let part_type = part.headers.get_first_value("Content-Type").unwrap_or_default();

            // html is sticky: a later text part never clears it
            if is_html_type(&part_type) {
                msg.is_html = true;
            }

            msg.body = decode_text(part, &content);
        }
    }
}

fn extract_attachment(part: &ParsedMail) -> Option<Attachment> {
    let disposition = part.get_content_disposition();

    let filename = disposition.params
        .get("filename")
        .filter(|name| !name.is_empty())
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
        .unwrap_or_default();

    let content_type = match part.headers.get_first_value("Content-Type") {
        Some(_) => part.ctype.mimetype.clone(),
        None => DEFAULT_ATTACHMENT_TYPE.to_string()
    };

    let content = match decode_transfer(&transfer_encoding(part), &part_body(part)) {
        Ok(content) => content,
        Err(err) => {
            warn!("Failed to decode attachment {filename:?}, skipping: {err}");
            return Option::None;
        }
    };

    if filename.is_empty() || content_type.is_empty() || content.is_empty() {
        warn!("Invalid attachment detected, skipping: filename={filename:?} content-type={content_type:?} length={}",
            content.len());
        return Option::None;
    }

    Some(Attachment {
        filename,
        content_type,
        content
    })
}

fn is_multipart(mail: &ParsedMail) -> bool {
    mail.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/")
}

fn is_html_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("html")
}

fn transfer_encoding(mail: &ParsedMail) -> String {
    mail.headers
        .get_first_value("Content-Transfer-Encoding")
        .unwrap_or_default()
}

/// The body exactly as it appeared on the wire, before any transfer decoding.
fn encoded_body(mail: &ParsedMail) -> Vec<u8> {
    match mail.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw().to_vec(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().to_vec(),
        Body::Binary(body) => body.get_raw().to_vec(),
    }
}

/// Body of a multipart subpart. The line break before the next boundary
/// belongs to the delimiter, not to the part.
fn part_body(part: &ParsedMail) -> Vec<u8> {
    let mut body = encoded_body(part);

    if body.ends_with(b"\r\n") {
        body.truncate(body.len() - 2);
    } else if body.ends_with(b"\n") {
        body.pop();
    }

    body
}

fn decode_text(mail: &ParsedMail, content: &[u8]) -> String {
    // mailparse reports us-ascii when no charset was given
    let declared = mail.ctype.params
        .get("charset")
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()));

    match declared {
        Some(encoding) => encoding.decode_without_bom_handling(content).0.into_owned(),
        None => String::from_utf8_lossy(content).into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn multipart(kind: &str, boundary: &str, parts: &[&str]) -> String {
        let mut msg = format!(
            "From: test@example.com\r\nTo: you@example.com\r\nSubject: Multipart\r\n\
             MIME-Version: 1.0\r\nContent-Type: multipart/{kind}; boundary=\"{boundary}\"\r\n\r\n"
        );

        for part in parts {
            msg.push_str(&format!("--{boundary}\r\n{part}\r\n"));
        }

        msg.push_str(&format!("--{boundary}--\r\n"));
        msg
    }

    #[test]
    fn decodes_transfer_encodings() {
        let input = STANDARD.encode("hello world");
        assert_eq!(b"hello world".to_vec(), decode_transfer("base64", input.as_bytes()).unwrap());
        assert_eq!(b"hello world".to_vec(), decode_transfer(" BASE64 ", b"aGVsbG8g\r\nd29ybGQ=").unwrap());
        assert_eq!(b"hello world!".to_vec(), decode_transfer("quoted-printable", b"hello=20world=21").unwrap());
        assert_eq!(b"plain text".to_vec(), decode_transfer("", b"plain text").unwrap());
        assert!(decode_transfer("base64", b"!!not base64!!").is_err());
    }

    #[test]
    fn simple_message() {
        let raw = "From: test@example.com\r\nTo: you@example.com\r\nSubject: Hello\r\n\r\nThis is the body.";
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("Hello", msg.subject);
        assert_eq!("This is the body.", msg.body);
        assert!(!msg.is_html);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn simple_html_message() {
        let raw = "From: test@example.com\r\nSubject: Hello\r\nContent-Type: text/html\r\n\r\n<html><body>Hi!</body></html>\r\n";
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("<html><body>Hi!</body></html>", msg.body.trim_end());
        assert!(msg.is_html);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn non_multipart_body_is_transfer_decoded() {
        let raw = "Subject: Encoded\r\nContent-Transfer-Encoding: base64\r\n\r\nVGhpcyBpcyB0aGUgYm9keS4=\r\n";
        let msg = decode_message(raw.as_bytes()).unwrap();
        assert_eq!("This is the body.", msg.body);

        let raw = "Subject: Broken\r\nContent-Transfer-Encoding: base64\r\n\r\n!!not base64!!\r\n";
        assert!(matches!(decode_message(raw.as_bytes()), Err(DecodeError::Body(_))));
    }

    #[test]
    fn multipart_with_attachment() {
        let raw = multipart("mixed", "XYZ", &[
            "Content-Type: text/plain\r\nContent-Transfer-Encoding: 7bit\r\n\r\nThis is the body.",
            "Content-Type: text/plain; name=\"file.txt\"\r\n\
             Content-Disposition: attachment; filename=\"file.txt\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\nZmlsZSBjb250ZW50",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("Multipart", msg.subject);
        assert_eq!("This is the body.", msg.body);
        assert!(!msg.is_html);
        assert_eq!(1, msg.attachments.len());
        assert_eq!("file.txt", msg.attachments[0].filename);
        assert_eq!("text/plain", msg.attachments[0].content_type);
        assert_eq!(b"file content".to_vec(), msg.attachments[0].content);
    }

    #[test]
    fn multipart_html_body() {
        let raw = multipart("alternative", "b1", &[
            "Content-Type: text/html\r\nContent-Transfer-Encoding: 7bit\r\n\r\n<b>HTML Body</b>",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("<b>HTML Body</b>", msg.body);
        assert!(msg.is_html);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn multipart_attachment_only() {
        let raw = multipart("mixed", "b2", &[
            "Content-Type: application/octet-stream; name=\"file.bin\"\r\n\
             Content-Disposition: attachment; filename=\"file.bin\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\nYmluYXJ5ZGF0YQ==",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("", msg.body);
        assert!(!msg.is_html);
        assert_eq!(1, msg.attachments.len());
        assert_eq!("file.bin", msg.attachments[0].filename);
        assert_eq!("application/octet-stream", msg.attachments[0].content_type);
        assert_eq!(b"binarydata".to_vec(), msg.attachments[0].content);
    }

    #[test]
    fn invalid_attachments_are_skipped() {
        let raw = multipart("mixed", "b3", &[
            "Content-Type: text/plain\r\n\r\nBody text",
            // no filename anywhere
            "Content-Type: text/plain\r\nContent-Disposition: attachment\r\n\
             Content-Transfer-Encoding: base64\r\n\r\nZmlsZSBjb250ZW50",
            // empty content
            "Content-Type: text/plain\r\nContent-Disposition: attachment; filename=\"empty.txt\"\r\n\r\n",
            // broken base64
            "Content-Type: text/plain\r\nContent-Disposition: attachment; filename=\"bad.txt\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\n!!!!",
            // name only on the content type
            "Content-Type: application/pdf; name=\"report.pdf\"\r\nContent-Disposition: attachment\r\n\
             Content-Transfer-Encoding: base64\r\n\r\nJVBERi0=",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("Body text", msg.body);
        assert_eq!(1, msg.attachments.len());
        assert_eq!("report.pdf", msg.attachments[0].filename);
        assert_eq!("application/pdf", msg.attachments[0].content_type);
        assert_eq!(b"%PDF-".to_vec(), msg.attachments[0].content);
    }

    #[test]
    fn nested_alternative_inside_mixed() {
        let inner = "Content-Type: multipart/alternative; boundary=\"inner\"\r\n\r\n\
                     --inner\r\nContent-Type: text/plain\r\n\r\nplain version\r\n\
                     --inner\r\nContent-Type: text/html; charset=utf-8\r\n\
                     Content-Transfer-Encoding: quoted-printable\r\n\r\n<p>html=20version</p>\r\n\
                     --inner--";
        let raw = multipart("mixed", "outer", &[
            inner,
            "Content-Type: text/csv\r\nContent-Disposition: attachment; filename=\"data.csv\"\r\n\r\na,b\r\n1,2",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("<p>html version</p>", msg.body);
        assert!(msg.is_html);
        assert_eq!(1, msg.attachments.len());
        assert_eq!("data.csv", msg.attachments[0].filename);
        assert_eq!("text/csv", msg.attachments[0].content_type);
        assert_eq!(b"a,b\r\n1,2".to_vec(), msg.attachments[0].content);
    }

    #[test]
    fn boundary_line_break_is_not_part_content() {
        let raw = multipart("mixed", "b5", &[
            "Content-Type: text/plain\r\n\r\nThis is the body.",
            "Content-Type: text/csv\r\nContent-Disposition: attachment; filename=\"data.csv\"\r\n\r\na,b",
            "Content-Type: text/plain\r\nContent-Disposition: attachment; filename=\"empty.txt\"\r\n\r\n",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("This is the body.", msg.body);
        assert_eq!(1, msg.attachments.len());
        assert_eq!("data.csv", msg.attachments[0].filename);
        assert_eq!(b"a,b".to_vec(), msg.attachments[0].content);
    }

    #[test]
    fn html_flag_is_never_downgraded() {
        let raw = multipart("alternative", "b4", &[
            "Content-Type: text/html\r\n\r\n<i>first</i>",
            "Content-Type: text/plain\r\n\r\nsecond",
        ]);
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("second", msg.body);
        assert!(msg.is_html);
    }

    #[test]
    fn legacy_charset_body() {
        let raw = "Subject: Menu\r\nContent-Type: text/plain; charset=iso-8859-1\r\n\
                   Content-Transfer-Encoding: quoted-printable\r\n\r\ncaf=E9";
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("café", msg.body);
    }

    #[test]
    fn declared_charset_wins_over_utf8() {
        let mut raw = b"Subject: Menu\r\nContent-Type: text/plain; charset=iso-8859-1\r\n\r\n".to_vec();
        raw.extend_from_slice(b"\xC3\xA9");
        let msg = decode_message(&raw).unwrap();
        assert_eq!("\u{C3}\u{A9}", msg.body);

        let mut raw = b"Subject: Menu\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        raw.extend_from_slice(b"caf\xC3\xA9");
        let msg = decode_message(&raw).unwrap();
        assert_eq!("café", msg.body);
    }

    #[test]
    fn encoded_subject() {
        let raw = "From: test@example.com\r\nSubject: =?UTF-8?B?SGVsbG8g8J+agA==?=\r\n\r\nBody";
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("Hello \u{1F680}", msg.subject);
        assert_eq!("Body", msg.body);
    }

    #[test]
    fn undecodable_subject_is_kept_verbatim() {
        let raw = "Subject: =?x-no-such-charset?Q?abc?=\r\n\r\nBody";
        let msg = decode_message(raw.as_bytes()).unwrap();

        assert_eq!("=?x-no-such-charset?Q?abc?=", msg.subject);
    }

    proptest! {
        #[test]
        fn base64_round_trip(content in prop::collection::vec(any::<u8>(), 0..1024)) {
            let encoded = STANDARD.encode(&content);
            // wrapped the way mail clients wrap it
            let wrapped = encoded
                .as_bytes()
                .chunks(76)
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect::<Vec<_>>()
                .join("\r\n");

            prop_assert_eq!(&content, &decode_transfer("base64", wrapped.as_bytes()).unwrap());
        }

        #[test]
        fn quoted_printable_round_trip(content in "[!-~]([ -~]{0,300}[!-~])?") {
            let encoded = quoted_printable::encode(content.as_bytes());
            prop_assert_eq!(content.as_bytes(), &decode_transfer("quoted-printable", &encoded).unwrap()[..]);
        }

        #[test]
        fn other_encodings_pass_through(
            encoding in prop::sample::select(vec!["", "7bit", "8bit", "binary", "x-unknown"]),
            content in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            prop_assert_eq!(&content, &decode_transfer(encoding, &content).unwrap());
        }
    }
}
