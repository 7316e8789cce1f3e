//! Extracts a best-effort `Subject` and plain-text body from a raw message.
//!
//! Uses `mailparse`'s lenient RFC 5322 parser. Parsing never fails from this
//! module's point of view: any error, or the absence of UTF-8 text, degrades
//! into a lossy decode of the entire raw message.

use log::debug;

/// Parses `raw_message` and returns `(subject, body)`, both UTF-8.
pub fn parse(raw_message: &[u8]) -> (String, String) {
    match mailparse::parse_mail(raw_message) {
        Ok(mail) => {
            let subject = mail
                .headers
                .iter()
                .find(|h| h.get_key_ref().eq_ignore_ascii_case("Subject"))
                .map(|h| h.get_value())
                .unwrap_or_default();

            let body = extract_body(&mail).unwrap_or_else(|| lossy(raw_message));
            (subject, body)
        }
        Err(e) => {
            debug!("mail parse failed, falling back to raw message: {e}");
            (String::new(), lossy(raw_message))
        }
    }
}

/// Returns the first `text/plain` part's decoded body, walking subparts for
/// multipart messages, or the single part's body otherwise.
fn extract_body(mail: &mailparse::ParsedMail) -> Option<String> {
    if mail.subparts.is_empty() {
        return body_of(mail);
    }
    find_text_plain(mail).and_then(body_of)
}

fn find_text_plain<'a>(mail: &'a mailparse::ParsedMail<'a>) -> Option<&'a mailparse::ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return Some(mail);
        }
        return None;
    }
    mail.subparts.iter().find_map(find_text_plain)
}

fn body_of(mail: &mailparse::ParsedMail) -> Option<String> {
    mail.get_body().ok()
}

fn lossy(raw_message: &[u8]) -> String {
    String::from_utf8_lossy(raw_message).into_owned()
}
