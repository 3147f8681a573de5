// SPDX-License-Identifier: MIT

//! Validation of command arguments before they reach a subprocess.
//!
//! Every token the client can influence is checked against a
//! declarative table: option flags must be in a fixed allowlist, and
//! keyed argument values are checked according to their kind. Nothing
//! reaches the signing tool's command line unchecked, and validation
//! always completes before a staging file is retained or a process is
//! spawned.

use std::collections::HashMap;

use crate::error::ServiceError;

/// The two operations the gateway exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Sign,
    Verify,
}

impl CommandKind {
    /// The verb passed to the signing tool, also the wire value of the
    /// `command` query parameter.
    pub fn verb(&self) -> &'static str {
        match self {
            CommandKind::Sign => "sign",
            CommandKind::Verify => "verify",
        }
    }

    /// Parse the `command` query value; the match is case-insensitive
    /// as the original tool treats its verbs that way.
    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        if value.eq_ignore_ascii_case("sign") {
            Ok(CommandKind::Sign)
        } else if value.eq_ignore_ascii_case("verify") {
            Ok(CommandKind::Verify)
        } else {
            Err(ServiceError::UnknownCommand(value.to_string()))
        }
    }
}

/// How a keyed argument's value is checked.
#[derive(Debug, Clone, Copy)]
enum ArgKind {
    /// Hexadecimal string, e.g. a certificate thumbprint.
    Hex,
    /// Well-formed URL, e.g. a timestamp server.
    Uri,
    /// Free text restricted to the shared character rules.
    Text,
}

/// Keyed arguments accepted on the query string, in the order they
/// are forwarded to the tool. Adding an argument is a table change.
const KEYED_ARGS: &[(&str, ArgKind)] = &[
    ("td", ArgKind::Text),
    ("sha1", ArgKind::Hex),
    ("fd", ArgKind::Text),
    ("t", ArgKind::Uri),
    ("tr", ArgKind::Uri),
];

/// Short option flags the tool accepts. Any other token is rejected.
const OPTION_ALLOWLIST: &[&str] = &["a", "as", "q", "v", "r", "u", "uw", "ph", "debug"];

/// Arguments that have passed validation and may be turned into a
/// command line.
#[derive(Debug, Clone, Default)]
pub struct ValidatedArgs {
    options: Vec<String>,
    keyed: Vec<(&'static str, String)>,
}

impl ValidatedArgs {
    /// Validate the query parameters of one request.
    ///
    /// `query` must no longer contain the `command` key; `options` is
    /// a comma-joined list of flags and everything else must be a
    /// known keyed argument.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, ServiceError> {
        let mut args = ValidatedArgs::default();

        if let Some(options) = query.get("options") {
            for token in options.split(',').filter(|token| !token.is_empty()) {
                if !OPTION_ALLOWLIST.contains(&token) {
                    return Err(ServiceError::InvalidOption(token.to_string()));
                }
                args.options.push(token.to_string());
            }
        }

        for (name, kind) in KEYED_ARGS {
            if let Some(value) = query.get(*name) {
                check_value(name, *kind, value)?;
                args.keyed.push((name, value.clone()));
            }
        }

        for name in query.keys() {
            let known =
                name == "options" || KEYED_ARGS.iter().any(|(known, _)| known == name);
            if !known {
                return Err(ServiceError::InvalidArgument {
                    name: name.clone(),
                    value: query.get(name).cloned().unwrap_or_default(),
                    reason: "unrecognized argument".to_string(),
                });
            }
        }

        Ok(args)
    }

    /// The validated option flags, in the order they arrived.
    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    /// The validated keyed arguments, in table order.
    pub fn keyed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keyed.iter().map(|(name, value)| (*name, value.as_str()))
    }

    /// Look up a single keyed argument.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.keyed
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Character rules shared by every keyed argument, plus the per-kind
/// check. Spaces, backslashes, quotes and control bytes would let a
/// value escape the downstream command line.
fn check_value(name: &'static str, kind: ArgKind, value: &str) -> Result<(), ServiceError> {
    let reject = |reason: &str| {
        Err(ServiceError::InvalidArgument {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        })
    };

    if value.is_empty() {
        return reject("empty value");
    }
    if value
        .chars()
        .any(|c| c == ' ' || c == '\\' || c == '"' || c == '\'' || (c as u32) < 0x20)
    {
        return reject("contains a space, quote, backslash, or control character");
    }

    match kind {
        ArgKind::Hex => {
            if hex::decode(value).is_err() {
                return reject("not a hexadecimal string");
            }
        }
        ArgKind::Uri => {
            if url::Url::parse(value).is_err() {
                return reject("not a well-formed URL");
            }
        }
        ArgKind::Text => {}
    }

    Ok(())
}
