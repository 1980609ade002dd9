//! Bulk request encoding and response classification.
//!
//! Requests follow the search backend's bulk wire format: newline-delimited
//! JSON where each document is preceded by a `create` action line and the
//! body ends with a newline. Responses are classified into a [`Disposition`]
//! that tells the submitter whether to retry, give up on the batch, or halt
//! the run.

use ballast_payload::Record;
use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Errors produced by this module.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`serde_json::Error`].
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Action<'a> {
    create: ActionMeta<'a>,
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

/// Encode `records` as a bulk request body addressed to `index`.
///
/// The `create` op-type is used so the body is valid against data streams
/// as well as plain indices.
///
/// # Errors
///
/// Returns an error if a record cannot be serialized.
pub fn body(index: &str, records: &[Record]) -> Result<Bytes, Error> {
    let mut buf = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(
            &mut buf,
            &Action {
                create: ActionMeta { index },
            },
        )?;
        buf.push(b'\n');
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(Bytes::from(buf))
}

/// How a submission attempt settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request went through. Individual documents may still have been
    /// rejected and those are final.
    Success {
        /// Documents the backend accepted.
        accepted: u64,
        /// Documents the backend rejected item-by-item.
        rejected: u64,
    },
    /// The whole request failed in a way worth another attempt.
    Transient,
    /// The whole request failed and retrying cannot help.
    Permanent(StatusCode),
    /// Credentials were refused. The run must halt.
    Fatal(StatusCode),
}

impl Disposition {
    /// Classify a non-2xx response status.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Disposition::Fatal(status),
            StatusCode::TOO_MANY_REQUESTS => Disposition::Transient,
            status if status.is_server_error() => Disposition::Transient,
            _ => Disposition::Permanent(status),
        }
    }
}

/// Body of a bulk response.
///
/// The backend sends more fields than these. Unknown fields are ignored,
/// only the per-item outcomes matter here.
#[derive(Debug, Deserialize)]
pub struct Response {
    /// Milliseconds the backend spent servicing the request.
    pub took: u64,
    /// Whether any item was rejected.
    pub errors: bool,
    /// Per-document outcomes, in submission order.
    pub items: Vec<Item>,
}

/// One document's outcome within a bulk response.
#[derive(Debug, Deserialize)]
pub struct Item {
    /// Outcome of the `create` action.
    pub create: ItemStatus,
}

/// Status of a single `create` action.
#[derive(Debug, Deserialize)]
pub struct ItemStatus {
    /// HTTP-equivalent status for this document.
    pub status: u16,
    /// Failure detail, absent when the document was accepted.
    pub error: Option<ItemError>,
}

/// Failure detail for a rejected document.
#[derive(Debug, Deserialize)]
pub struct ItemError {
    /// Failure class, for instance `mapper_parsing_exception`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable explanation.
    pub reason: Option<String>,
}

impl Response {
    /// Tally this response into a [`Disposition::Success`]. Item-level
    /// rejections are final, never retried, so a parseable response is
    /// always a success at the request level.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        if !self.errors {
            return Disposition::Success {
                accepted: self.items.len() as u64,
                rejected: 0,
            };
        }
        let rejected = self
            .items
            .iter()
            .filter(|item| item.create.status >= 300)
            .count() as u64;
        Disposition::Success {
            accepted: self.items.len() as u64 - rejected,
            rejected,
        }
    }

    /// Rejected items, in submission order.
    pub fn rejections(&self) -> impl Iterator<Item = &ItemStatus> {
        self.items
            .iter()
            .map(|item| &item.create)
            .filter(|status| status.status >= 300)
    }
}

#[cfg(test)]
mod tests {
    use ballast_payload::Synthesizer;
    use http::StatusCode;

    use super::{Disposition, Response, body};

    #[test]
    fn body_is_newline_framed() {
        let synthesizer = Synthesizer::new([2; 32]);
        let records: Vec<_> = (0..2)
            .map(|sequence| synthesizer.synthesize(sequence).expect("synthesize failed"))
            .collect();

        let body = body("app-logs", &records).expect("body failed");
        let text = std::str::from_utf8(&body).expect("body not utf8");
        assert!(text.ends_with('\n'));

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        for pair in lines.chunks(2) {
            let action: serde_json::Value =
                serde_json::from_str(pair[0]).expect("action line not JSON");
            assert_eq!(action["create"]["_index"], "app-logs");
            let document: serde_json::Value =
                serde_json::from_str(pair[1]).expect("document line not JSON");
            assert!(document.get("@timestamp").is_some());
        }
    }

    #[test]
    fn empty_body_is_empty() {
        let body = body("app-logs", &[]).expect("body failed");
        assert!(body.is_empty());
    }

    #[test]
    fn clean_response_counts_everything_accepted() {
        let response: Response = serde_json::from_str(
            r#"{"took":12,"errors":false,"items":[
                {"create":{"_index":"app-logs","_id":"a","status":201,"result":"created"}},
                {"create":{"_index":"app-logs","_id":"b","status":201,"result":"created"}}
            ]}"#,
        )
        .expect("parse failed");

        assert_eq!(
            response.disposition(),
            Disposition::Success {
                accepted: 2,
                rejected: 0
            }
        );
        assert_eq!(response.rejections().count(), 0);
    }

    #[test]
    fn rejected_items_are_tallied() {
        let response: Response = serde_json::from_str(
            r#"{"took":3,"errors":true,"items":[
                {"create":{"_index":"app-logs","status":201}},
                {"create":{"_index":"app-logs","status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse field"}}},
                {"create":{"_index":"app-logs","status":429,"error":{"type":"es_rejected_execution_exception"}}}
            ]}"#,
        )
        .expect("parse failed");

        assert_eq!(
            response.disposition(),
            Disposition::Success {
                accepted: 1,
                rejected: 2
            }
        );
        let kinds: Vec<&str> = response
            .rejections()
            .filter_map(|status| status.error.as_ref())
            .map(|error| error.kind.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec!["mapper_parsing_exception", "es_rejected_execution_exception"]
        );
    }

    #[test]
    fn statuses_classify() {
        assert_eq!(
            Disposition::from_status(StatusCode::UNAUTHORIZED),
            Disposition::Fatal(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(
            Disposition::from_status(StatusCode::FORBIDDEN),
            Disposition::Fatal(StatusCode::FORBIDDEN)
        );
        assert_eq!(
            Disposition::from_status(StatusCode::TOO_MANY_REQUESTS),
            Disposition::Transient
        );
        assert_eq!(
            Disposition::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            Disposition::Transient
        );
        assert_eq!(
            Disposition::from_status(StatusCode::SERVICE_UNAVAILABLE),
            Disposition::Transient
        );
        assert_eq!(
            Disposition::from_status(StatusCode::BAD_REQUEST),
            Disposition::Permanent(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            Disposition::from_status(StatusCode::PAYLOAD_TOO_LARGE),
            Disposition::Permanent(StatusCode::PAYLOAD_TOO_LARGE)
        );
        assert_eq!(
            Disposition::from_status(StatusCode::NOT_FOUND),
            Disposition::Permanent(StatusCode::NOT_FOUND)
        );
    }
}
