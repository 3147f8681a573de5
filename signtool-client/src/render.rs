// SPDX-License-Identifier: MIT

//! Rendering of structured verification responses.

use serde::Deserialize;

use crate::{EXIT_SUCCESS, EXIT_TOOL_FAILURE};

/// A verification record as received from the gateway.
///
/// Every field is optional on the wire; a missing status simply never
/// counts as valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerifyRecord {
    #[serde(default)]
    pub signer_certificate: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// The program's externally observable verdict: zero only when the
/// gateway reported the one success status.
pub fn exit_code(record: &VerifyRecord) -> i32 {
    if record.status.as_deref() == Some("Valid") {
        EXIT_SUCCESS
    } else {
        EXIT_TOOL_FAILURE
    }
}

/// Reduce a PEM-encoded certificate to its uppercase hex SHA-1
/// thumbprint for display. Values that are not PEM (already a
/// thumbprint) pass through unchanged.
pub fn thumbprint(value: &str) -> String {
    if !value.contains("-----BEGIN CERTIFICATE-----") {
        return value.to_string();
    }
    openssl::x509::X509::from_pem(value.as_bytes())
        .and_then(|certificate| certificate.digest(openssl::hash::MessageDigest::sha1()))
        .map(|digest| hex::encode_upper(&*digest))
        .unwrap_or_else(|_| value.to_string())
}

/// Render the record as a three-line fixed-width table: header row,
/// a separator of `-` repeated to each header's length, and a value
/// row. Columns are separated by one space and each column is as wide
/// as the longer of its header and its value.
pub fn table(record: &VerifyRecord) -> String {
    let columns = [
        (
            "SignerCertificate",
            thumbprint(record.signer_certificate.as_deref().unwrap_or_default()),
        ),
        ("Status", record.status.clone().unwrap_or_default()),
        (
            "StatusMessage",
            record.status_message.clone().unwrap_or_default(),
        ),
        ("Path", record.path.clone().unwrap_or_default()),
    ];

    let mut rows = [String::new(), String::new(), String::new()];
    for (index, (name, value)) in columns.iter().enumerate() {
        let width = name.chars().count().max(value.chars().count());
        if index > 0 {
            for row in &mut rows {
                row.push(' ');
            }
        }
        rows[0].push_str(&format!("{name:<width$}"));
        rows[1].push_str(&format!("{:<width$}", "-".repeat(name.chars().count())));
        rows[2].push_str(&format!("{value:<width$}"));
    }

    rows.iter()
        .map(|row| row.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}
