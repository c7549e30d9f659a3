use webhook_notify::{find_signature_header, sign, verify_signature, DEFAULT_SIGNATURE_HEADER};

fn main() {
    let secret = "0123456789abcdef0123456789abcdef";
    let body = br#"{"id":"1f0c","attempt":1,"properties":{},"notifications":[{"action":"order.created","payload":{"id":123}}]}"#;

    let signature = sign(secret, body);
    let headers = vec![
        ("content-type", "application/json; charset=utf-8"),
        ("x-webhook-signature", signature.as_str()),
    ];

    let header = find_signature_header(headers.iter().map(|(k, v)| (*k, *v)), DEFAULT_SIGNATURE_HEADER);
    let valid = header.is_some_and(|value| verify_signature(secret, body, value));

    println!("signature valid: {valid}");
}
