// ABOUTME: MM4 MIME multipart construction for outbound relay
// ABOUTME: Inbound parsing is handled by `mail_parser`; this module only builds the outbound wire format

use crate::envelope::{Envelope, FileAttachment};

/// Wrap base64 text at 76 characters per line, CRLF-terminated, as MM4 peers
/// expect.
fn wrap_base64(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push_str("\r\n");
    }
    out
}

/// A minimal SMIL index referencing every image part by filename, single
/// slide, 5 second duration.
fn build_smil(image_files: &[&FileAttachment]) -> String {
    let refs: String = image_files
        .iter()
        .map(|f| format!("<img src=\"{}\" region=\"Image\"/>", f.filename))
        .collect();
    format!(
        "<smil><head><layout><root-layout width=\"320px\" height=\"480px\"/>\
<region id=\"Image\" width=\"320px\" height=\"400px\" fit=\"meet\"/></layout></head>\
<body><par dur=\"5000ms\">{refs}</par></body></smil>"
    )
}

/// Build a complete MIME multipart/related body for `envelope`, with a
/// generated `index.smil` as the root part followed by every attachment,
/// each base64-encoded at 76-char line width.
pub fn build_multipart(envelope: &Envelope) -> (String, String) {
    let boundary = format!("mm4-{}", uuid::Uuid::new_v4());
    let images: Vec<&FileAttachment> = envelope
        .files
        .iter()
        .filter(|f| f.mime_type.starts_with("image/"))
        .collect();

    let mut body = String::new();
    body.push_str(&format!("--{boundary}\r\n"));
    body.push_str("Content-Type: application/smil\r\n");
    body.push_str("Content-Transfer-Encoding: 7bit\r\n");
    body.push_str("Content-Location: index.smil\r\n\r\n");
    body.push_str(&build_smil(&images));
    body.push_str("\r\n");

    for file in &envelope.files {
        body.push_str(&format!("--{boundary}\r\n"));
        body.push_str(&format!("Content-Type: {}\r\n", file.mime_type));
        body.push_str("Content-Transfer-Encoding: base64\r\n");
        body.push_str(&format!("Content-Location: {}\r\n\r\n", file.filename));
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &file.bytes);
        body.push_str(&wrap_base64(&encoded));
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    (body, format!("multipart/related; type=\"application/smil\"; boundary=\"{boundary}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    #[test]
    fn multipart_includes_smil_and_every_attachment() {
        let mut env = Envelope::new("+1", "+2", MessageKind::Mms).with_text("hi");
        env.files.push(FileAttachment::new("a.jpg", "image/jpeg", vec![1, 2, 3]));
        let (body, content_type) = build_multipart(&env);
        assert!(content_type.starts_with("multipart/related"));
        assert!(body.contains("index.smil"));
        assert!(body.contains("a.jpg"));
        assert!(body.contains("<smil>"));
    }
}
