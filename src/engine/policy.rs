//! Merging of IAM policy documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Deserialize)]
struct InputDocument {
    #[serde(rename = "Statement", default)]
    statement: Option<Statements>,
}

/// `Statement` may be one object or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Statements {
    Many(Vec<serde_json::Map<String, Value>>),
    One(serde_json::Map<String, Value>),
}

#[derive(Debug, Serialize)]
struct OutputDocument {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Statement")]
    statement: Vec<serde_json::Map<String, Value>>,
}

/// Concatenates the statements of `policies` in order into one document.
///
/// Empty inputs are skipped. When no statements remain the result is the
/// empty string, which callers treat as "no inline policy". Statements are
/// kept as written, including their `Action` shape and any unknown keys.
pub fn combine<I, S>(policies: I) -> Result<String, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut statement = Vec::new();

    for (i, policy) in policies.into_iter().enumerate() {
        let policy = policy.as_ref().trim();
        if policy.is_empty() {
            continue;
        }

        let doc: InputDocument = serde_json::from_str(policy)
            .map_err(|e| Error::validation(format!("policy document {i} is not valid: {e}")))?;

        match doc.statement {
            Some(Statements::Many(many)) => statement.extend(many),
            Some(Statements::One(one)) => statement.push(one),
            None => {}
        }
    }

    if statement.is_empty() {
        return Ok(String::new());
    }

    Ok(serde_json::to_string(&OutputDocument {
        version: POLICY_VERSION,
        statement,
    })?)
}

/// Re-serializes a JSON document without insignificant whitespace.
pub fn compact(document: &str) -> Result<String, Error> {
    let value: Value = serde_json::from_str(document)
        .map_err(|e| Error::validation(format!("cannot parse policy document: {e}")))?;
    Ok(serde_json::to_string(&value)?)
}
