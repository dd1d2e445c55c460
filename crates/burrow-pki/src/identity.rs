//! Peer identity from X.509 subjects.

/// Subject common name of a DER certificate.
///
/// `None` when the certificate does not parse or has no UTF-8 CN.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
        .filter(|cn| !cn.is_empty())
}
