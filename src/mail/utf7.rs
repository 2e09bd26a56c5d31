//! IMAP modified UTF-7 (RFC 3501 §5.1.3) for folder names.

use utf7_imap::{decode_utf7_imap, encode_utf7_imap};

/// Decodes a folder name as sent by the server.
pub fn decode(name: &str) -> String {
    decode_utf7_imap(name.to_owned())
}

/// Encodes a display name into wire form.
pub fn encode(name: &str) -> String {
    encode_utf7_imap(name.to_owned())
}

/// Name to send in SELECT. Plain ASCII without `&` is identical in both
/// forms and goes out as is.
pub fn wire_name(name: &str) -> String {
    if name.is_ascii() && !name.contains('&') {
        name.to_string()
    } else {
        encode(name)
    }
}
