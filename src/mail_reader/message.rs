use chrono::{DateTime, Utc};
use itertools::Itertools;
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};

use crate::error::NormalizeError;
use crate::mail_reader::RawMessage;
use crate::models::{NewAttachment, NewEmail};

const MISSING_SUBJECT: &str = "(No Subject)";

/// Turn a raw fetched message into a persistable record. Pure: no I/O, no
/// side effects. Missing or malformed optional fields fall back to defaults;
/// only an undecodable message structure is an error.
pub fn normalize(raw: &RawMessage) -> Result<NewEmail, NormalizeError> {
    let parsed = parse_mail(&raw.body).map_err(|e| NormalizeError(e.to_string()))?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_else(|| MISSING_SUBJECT.to_string());
    let sender = parsed.headers.get_first_value("From").unwrap_or_default();
    let recipients = joined_header(&parsed, "To");
    let cc = joined_header(&parsed, "Cc");

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or(raw.internal_date);

    let body_text = find_body(&parsed, "text/plain").unwrap_or_default();
    let body_html = find_body(&parsed, "text/html");

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments);

    Ok(NewEmail {
        // The raw UID string is the dedup key even when it is not numeric
        message_id: raw.uid.clone(),
        uid: raw.uid.parse().ok(),
        subject,
        sender,
        recipients,
        cc,
        body_text,
        body_html,
        date,
        flags: raw.flags.iter().join(", "),
        attachments,
    })
}

fn joined_header(parsed: &ParsedMail, name: &str) -> String {
    parsed.headers.get_all_values(name).iter().join(", ")
}

// Depth-first search for the first non-attachment part of the given type
fn find_body(part: &ParsedMail, mimetype: &str) -> Option<String> {
    if part.ctype.mimetype.eq_ignore_ascii_case(mimetype)
        && part.get_content_disposition().disposition != DispositionType::Attachment
    {
        return part.get_body().ok();
    }

    for subpart in &part.subparts {
        if let Some(body) = find_body(subpart, mimetype) {
            return Some(body);
        }
    }

    None
}

fn collect_attachments(part: &ParsedMail, attachments: &mut Vec<NewAttachment>) {
    let disposition = part.get_content_disposition();

    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .unwrap_or_else(|| "unnamed_attachment".to_string());

        // Unreadable payloads count as zero-length rather than failing the message
        let size = part.get_body_raw().map(|b| b.len() as i64).unwrap_or(0);

        attachments.push(NewAttachment {
            filename,
            content_type: part.ctype.mimetype.clone(),
            size,
        });
    }

    // Recursively process subparts
    for subpart in &part.subparts {
        collect_attachments(subpart, attachments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(uid: &str, body: &str) -> RawMessage {
        RawMessage {
            uid: uid.to_string(),
            flags: vec!["\\Seen".to_string(), "\\Answered".to_string()],
            internal_date: None,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn plain_message_is_normalized() {
        let body = "Subject: Meeting tomorrow\r\n\
                    From: alice@example.com\r\n\
                    To: bob@example.com\r\n\
                    Date: Tue, 18 Aug 2026 10:00:00 +0000\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    See you at ten.\r\n";
        let email = normalize(&raw("42", body)).unwrap();

        assert_eq!(email.message_id, "42");
        assert_eq!(email.uid, Some(42));
        assert_eq!(email.subject, "Meeting tomorrow");
        assert_eq!(email.sender, "alice@example.com");
        assert_eq!(email.recipients, "bob@example.com");
        assert_eq!(email.cc, "");
        assert_eq!(email.body_text.trim(), "See you at ten.");
        assert!(email.body_html.is_none());
        assert_eq!(email.flags, "\\Seen, \\Answered");
        assert!(email.date.is_some());
    }

    #[test]
    fn missing_optional_headers_get_defaults() {
        let body = "From: alice@example.com\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    hi\r\n";
        let email = normalize(&raw("7", body)).unwrap();

        assert_eq!(email.subject, "(No Subject)");
        assert_eq!(email.recipients, "");
        assert_eq!(email.cc, "");
        assert!(email.date.is_none());
    }

    #[test]
    fn non_numeric_uid_keeps_string_key() {
        let body = "Subject: x\r\n\r\nbody\r\n";
        let email = normalize(&raw("abc-123", body)).unwrap();

        assert_eq!(email.message_id, "abc-123");
        assert_eq!(email.uid, None);
    }

    #[test]
    fn multipart_extracts_bodies_and_attachments() {
        let body = "Subject: Report\r\n\
                    From: alice@example.com\r\n\
                    Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
                    \r\n\
                    --sep\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    plain body\r\n\
                    --sep\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>html body</p>\r\n\
                    --sep\r\n\
                    Content-Type: application/pdf\r\n\
                    Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
                    \r\n\
                    not really a pdf\r\n\
                    --sep--\r\n";
        let email = normalize(&raw("9", body)).unwrap();

        assert_eq!(email.body_text.trim(), "plain body");
        assert_eq!(email.body_html.as_deref().map(str::trim), Some("<p>html body</p>"));
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "report.pdf");
        assert_eq!(email.attachments[0].content_type, "application/pdf");
        assert!(email.attachments[0].size > 0);
    }

    #[test]
    fn header_date_falls_back_to_internal_date() {
        let body = "Subject: x\r\n\r\nbody\r\n";
        let mut message = raw("3", body);
        message.internal_date = DateTime::from_timestamp(1_700_000_000, 0);

        let email = normalize(&message).unwrap();
        assert_eq!(email.date, message.internal_date);
    }
}
