//! Signer identity carried in short-lived signing certificates.

use x509_parser::der_parser::parse_der;
use x509_parser::prelude::*;

/// OIDC issuer, DER UTF8String.
pub const OIDC_ISSUER_V2_OID: &str = "1.3.6.1.4.1.57264.1.8";
/// Legacy OIDC issuer, raw bytes.
pub const OIDC_ISSUER_V1_OID: &str = "1.3.6.1.4.1.57264.1.1";

/// The OIDC issuer the certificate was minted for.
pub fn oidc_issuer(cert: &X509Certificate<'_>) -> Option<String> {
    let mut legacy = None;
    for ext in cert.extensions() {
        match ext.oid.to_id_string().as_str() {
            OIDC_ISSUER_V2_OID => {
                if let Ok((_, obj)) = parse_der(ext.value) {
                    if let Ok(issuer) = obj.as_str() {
                        return Some(issuer.to_string());
                    }
                }
            }
            OIDC_ISSUER_V1_OID => {
                legacy = std::str::from_utf8(ext.value).ok().map(str::to_string);
            }
            _ => {}
        }
    }
    legacy
}

/// Email and URI subject alternative names.
pub fn san_identities(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut identities = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::RFC822Name(email) => identities.push(email.to_string()),
                    GeneralName::URI(uri) => identities.push(uri.to_string()),
                    _ => {}
                }
            }
        }
    }
    identities
}

/// Glob match where `*` spans any run of characters, including none.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let last = parts.len() - 1;
    let mut pos = 0usize;

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == last {
            // Anchored at the end, and must not overlap what already matched.
            return value.len() >= pos + part.len() && value.ends_with(part);
        } else {
            match value[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }

    // Pattern ends with '*' here, or every part was consumed.
    pattern.ends_with('*') || pos == value.len()
}

/// Whether any identity matches any pattern.
pub fn subject_matches(identities: &[String], patterns: &[String]) -> bool {
    identities
        .iter()
        .any(|id| patterns.iter().any(|p| wildcard_match(p, id)))
}
