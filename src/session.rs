use rand::rngs::OsRng;
use rand::RngCore;

/// Length of a session id in hex characters (128 bits).
pub const SESSION_ID_LEN: usize = 32;

/// Generate a new tunnel session id.
///
/// 128 bits from the OS RNG, rendered as lowercase hex. The id is opaque to
/// both sides and only ever used as a map key and a URL query parameter, but
/// it must be unguessable: anyone who knows a live id can splice into the
/// session's upload and download flows.
pub fn new_session_id() -> String {
    let mut buf = [0u8; SESSION_ID_LEN / 2];
    OsRng.fill_bytes(&mut buf);

    let mut id = String::with_capacity(SESSION_ID_LEN);
    for byte in buf {
        use std::fmt::Write as _;
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Check that a session id has the shape `new_session_id` produces.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
