use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value for a callback body.
///
/// Returns `sha256=<lowercase hex of HMAC-SHA256(secret, body)>`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", compute_signature(secret.as_bytes(), body))
}

/// Hex-encoded HMAC-SHA256 of `payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    hex::encode(mac(secret, payload))
}

fn mac(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Compare two byte sequences without leaking where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Extract the raw digest bytes from a `sha256=<hex>` header value.
pub fn parse_signature_header(value: &str) -> Option<Vec<u8>> {
    let hex_digest = value.trim().strip_prefix(SIGNATURE_PREFIX)?;
    hex::decode(hex_digest).ok()
}

/// Receiver-side check of a signature header against a body.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(received) = parse_signature_header(header_value) else {
        return false;
    };
    constant_time_eq(&received, &mac(secret.as_bytes(), body))
}

/// Find the signature header among request headers (case-insensitive name).
pub fn find_signature_header<'a, I>(headers: I, signature_header: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(signature_header))
        .map(|(_, value)| value)
}
