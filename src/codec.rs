//! Wire format: a `"json|"`-tagged JSON object.
//!
//! There is only ever one shape per message kind in this crate, so encoding
//! is two plain functions per direction rather than a dispatch table keyed
//! on a configured serialization type — a single tag check covers it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constants::WIRE_TAG_JSON;
use crate::error::{CodecError, EncodedError};

/// The `func` sub-object of a Task-request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncRef {
    pub module: String,
    pub qualname: String,
}

impl FuncRef {
    /// `qualified_name` as used for registry lookups: `<module>.<qualname>`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.qualname)
    }
}

/// The `options.retry` sub-object of a Task-request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRetryOptions {
    pub max_retries: u32,
    /// Opaque list of exception-class tags; decodes to the same set of tags
    /// it was encoded from.
    pub on: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireTaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<WireRetryOptions>,
}

/// A decoded Task-request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub func: FuncRef,
    pub task_id: Option<String>,
    pub args: Option<serde_json::Value>,
    pub kwargs: Option<serde_json::Value>,
    #[serde(default)]
    pub options: WireTaskOptions,
}

/// A decoded AsyncResult message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAsyncResult {
    pub task_id: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EncodedError>,
}

fn split_tag(bytes: &[u8]) -> Result<(&str, &[u8]), CodecError> {
    let s = std::str::from_utf8(bytes).map_err(|_| CodecError::MissingTagSeparator)?;
    let (tag, rest) = s.split_once('|').ok_or(CodecError::MissingTagSeparator)?;
    Ok((tag, rest.as_bytes()))
}

pub fn encode_task_request(req: &TaskRequest) -> Vec<u8> {
    let body = serde_json::to_vec(req).expect("TaskRequest always serializes");
    let mut out = format!("{WIRE_TAG_JSON}|").into_bytes();
    out.extend_from_slice(&body);
    out
}

pub fn decode_task_request(bytes: &[u8]) -> Result<TaskRequest, CodecError> {
    let (tag, rest) = split_tag(bytes)?;
    if tag != WIRE_TAG_JSON {
        return Err(CodecError::UnknownTag(tag.to_string()));
    }
    Ok(serde_json::from_slice(rest)?)
}

pub fn encode_async_result(result: &WireAsyncResult) -> Vec<u8> {
    let body = serde_json::to_vec(result).expect("WireAsyncResult always serializes");
    let mut out = format!("{WIRE_TAG_JSON}|").into_bytes();
    out.extend_from_slice(&body);
    out
}

pub fn decode_async_result(bytes: &[u8]) -> Result<WireAsyncResult, CodecError> {
    let (tag, rest) = split_tag(bytes)?;
    if tag != WIRE_TAG_JSON {
        return Err(CodecError::UnknownTag(tag.to_string()));
    }
    Ok(serde_json::from_slice(rest)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_request_round_trips() {
        let req = TaskRequest {
            func: FuncRef {
                module: "myapp.tasks".to_string(),
                qualname: "add".to_string(),
            },
            task_id: Some("call-1".to_string()),
            args: Some(serde_json::json!([41, 1])),
            kwargs: Some(serde_json::json!({})),
            options: WireTaskOptions {
                retry: Some(WireRetryOptions {
                    max_retries: 2,
                    on: BTreeSet::from(["E1".to_string()]),
                }),
            },
        };
        let encoded = encode_task_request(&req);
        assert!(encoded.starts_with(b"json|"));
        let decoded = decode_task_request(&encoded).unwrap();
        assert_eq!(decoded.func.qualified_name(), "myapp.tasks.add");
        assert_eq!(decoded.task_id, req.task_id);
        assert_eq!(
            decoded.options.retry.unwrap().on,
            BTreeSet::from(["E1".to_string()])
        );
    }

    #[test]
    fn async_result_round_trips() {
        let result = WireAsyncResult {
            task_id: "call-1".to_string(),
            ready: true,
            result: Some(serde_json::json!(42)),
            error: None,
        };
        let encoded = encode_async_result(&result);
        let decoded = decode_async_result(&encoded).unwrap();
        assert_eq!(decoded.task_id, "call-1");
        assert_eq!(decoded.result, Some(serde_json::json!(42)));
        assert!(decoded.error.is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = b"bincode|garbage".to_vec();
        assert!(matches!(
            decode_task_request(&bytes),
            Err(CodecError::UnknownTag(_))
        ));
    }
}
