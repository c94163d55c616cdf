//! Notification message composition.
//!
//! One notification carries synthetic headers, class-specific boilerplate,
//! one report line per failed recipient, and a copy of the original message
//! (header block or full body, per the requested scope).

use chrono::Utc;
use courier_common::{Address, BounceClass, ReportScope};

/// Synthetic header block plus boilerplate and report lines, CRLF line
/// endings throughout, ending just before the copied original message.
#[must_use]
pub fn notice(
    smtpname: &str,
    sender: &Address,
    class: BounceClass,
    scope: ReportScope,
    reports: &[String],
) -> String {
    let subject = match class {
        BounceClass::Failed => "Delivery failure notification",
        BounceClass::Delayed => "Delivery delay notification",
        BounceClass::Status => "Delivery status notification",
    };
    let boilerplate = match class {
        BounceClass::Failed => {
            "This is the mail delivery system.\r\n\r\n\
             Your message could not be delivered to the following recipients.\r\n\
             This is a permanent error; the message has been given up on:\r\n"
        }
        BounceClass::Delayed => {
            "This is the mail delivery system.\r\n\r\n\
             Your message has not yet been delivered to the following recipients.\r\n\
             The system will keep trying until the message expires; no action is\r\n\
             required on your part:\r\n"
        }
        BounceClass::Status => {
            "This is the mail delivery system.\r\n\r\n\
             This is a delivery status notice for the following recipients:\r\n"
        }
    };
    let copy_intro = match scope {
        ReportScope::HeadersOnly => "Below is a copy of the original message's header block:",
        ReportScope::FullMessage => "Below is a copy of the original message:",
    };

    let mut out = String::new();
    out.push_str(&format!("Subject: {subject}\r\n"));
    out.push_str(&format!("From: Mailer Daemon <MAILER-DAEMON@{smtpname}>\r\n"));
    out.push_str(&format!("To: {sender}\r\n"));
    out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    out.push_str("Auto-Submitted: auto-replied\r\n");
    out.push_str("\r\n");
    out.push_str(boilerplate);
    out.push_str("\r\n");
    for report in reports {
        out.push_str(&format!("    {report}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(copy_intro);
    out.push_str("\r\n\r\n");
    out
}

/// One report line for a failed recipient.
#[must_use]
pub fn report_line(dest: &Address, diagnostic: &str) -> String {
    format!("{dest}: {diagnostic}")
}

/// Append `data` to `out` line by line, doubling any leading dot per the
/// wire transparency rule and normalizing line endings to CRLF.
pub fn push_stuffed(out: &mut Vec<u8>, data: &[u8]) {
    for line in data.split_inclusive(|byte| *byte == b'\n') {
        let body = line
            .strip_suffix(b"\n")
            .map(|rest| rest.strip_suffix(b"\r").unwrap_or(rest))
            .unwrap_or(line);
        if body.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sender() -> Address {
        Address::parse("sender@example.org").unwrap()
    }

    #[test]
    fn classes_use_distinct_boilerplate() {
        let reports = vec!["rcpt@example.com: 550 no such user".to_string()];
        let failed = notice(
            "smtp-in",
            &sender(),
            BounceClass::Failed,
            ReportScope::HeadersOnly,
            &reports,
        );
        let delayed = notice(
            "smtp-in",
            &sender(),
            BounceClass::Delayed,
            ReportScope::HeadersOnly,
            &reports,
        );

        assert!(failed.contains("permanent error"));
        assert!(delayed.contains("keep trying"));
        assert!(failed.contains("Auto-Submitted: auto-replied"));
        assert!(failed.contains("To: sender@example.org"));
        assert!(failed.contains("    rcpt@example.com: 550 no such user"));
    }

    #[test]
    fn leading_dots_are_doubled() {
        let mut out = Vec::new();
        push_stuffed(&mut out, b"line one\n.hidden\n..already\nno dot\n");
        assert_eq!(
            out,
            b"line one\r\n..hidden\r\n...already\r\nno dot\r\n".to_vec()
        );
    }

    #[test]
    fn endings_are_normalized_to_crlf() {
        let mut out = Vec::new();
        push_stuffed(&mut out, b"bare\nalready\r\nunterminated");
        assert_eq!(out, b"bare\r\nalready\r\nunterminated\r\n".to_vec());
    }
}
