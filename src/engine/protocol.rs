//! Line protocol spoken with the engine subprocess.
//!
//! One JSON object per line in each direction:
//! ```text
//! host → engine   {"id":"q7","moves":[["B","Q16"]],"rules":"japanese",...}\n
//! engine → host   {"id":"q7","rootInfo":{...},"moveInfos":[...]}\n
//! engine → host   {"id":"q8","error":"bad move"}\n
//! ```
//! The `id` field correlates responses with requests. Responses may arrive in
//! any order. Lines flagged `isDuringSearch` and warning lines are progress
//! notices, not answers.

use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::types::{Error, QueryId, Result};

/// Action sent by the health probe. Answered by the engine without a search.
pub const PROBE_ACTION: &str = "query_version";

/// One decoded line from the engine's output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineLine {
    pub id: QueryId,
    pub fields: Map<String, Value>,
}

impl EngineLine {
    /// Error reported by the engine for this query, if any.
    ///
    /// The `error` field is either a plain string or an object with a
    /// `message` field; anything else is rendered as JSON.
    pub fn error(&self) -> Option<String> {
        match self.fields.get("error")? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            Value::Object(obj) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }

    /// Whether this line is the final answer for its id.
    pub fn is_final(&self) -> bool {
        if self.fields.contains_key("error") {
            return true;
        }
        let during_search = self
            .fields
            .get("isDuringSearch")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        !during_search && !self.fields.contains_key("warning")
    }
}

/// Serialize a request line. The correlation id always overrides any `id` in `body`.
pub fn encode_request(id: &QueryId, body: &Map<String, Value>) -> Result<Vec<u8>> {
    let mut object = body.clone();
    object.insert("id".to_string(), Value::String(id.as_str().to_string()));
    let mut line = serde_json::to_vec(&Value::Object(object))?;
    line.push(b'\n');
    Ok(line)
}

/// Fill in `maxVisits` for analysis requests that do not set their own.
/// Action requests (`{"action": ...}`) are left untouched.
pub fn with_default_visits(mut body: Map<String, Value>, max_visits: u32) -> Map<String, Value> {
    if !body.contains_key("action") {
        body.entry("maxVisits")
            .or_insert_with(|| Value::from(max_visits));
    }
    body
}

/// Body of a health probe request.
pub fn probe_body() -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("action".to_string(), Value::String(PROBE_ACTION.to_string()));
    body
}

/// Parse one output line.
///
/// Lines that are not JSON objects with a string `id` are protocol errors;
/// the reader logs and discards them.
pub fn decode_line(line: &str) -> Result<EngineLine> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Error::protocol(format!("malformed response line: {}", e)))?;

    let Value::Object(mut fields) = value else {
        return Err(Error::protocol("response line is not a JSON object"));
    };

    let id = match fields.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(_) => return Err(Error::protocol("response id is not a non-empty string")),
        None => return Err(Error::protocol("response line has no id")),
    };

    Ok(EngineLine {
        id: QueryId::from_wire(id),
        fields,
    })
}

/// Write one encoded line and flush it.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_encode_overrides_body_id() {
        let body = object(json!({"id": "spoofed", "moves": [], "rules": "japanese"}));
        let line = encode_request(&QueryId::must("q1"), &body).unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(decoded, json!({"id": "q1", "moves": [], "rules": "japanese"}));
    }

    #[test]
    fn test_decode_success_line() {
        let line = decode_line(r#"{"id":"q3","rootInfo":{"winrate":0.48}}"#).unwrap();
        assert_eq!(line.id.as_str(), "q3");
        assert!(!line.fields.contains_key("id"));
        assert_eq!(line.fields["rootInfo"]["winrate"], json!(0.48));
        assert!(line.is_final());
        assert_eq!(line.error(), None);
    }

    #[test]
    fn test_decode_error_shapes() {
        let plain = decode_line(r#"{"id":"q1","error":"illegal move"}"#).unwrap();
        assert_eq!(plain.error().as_deref(), Some("illegal move"));

        let nested = decode_line(r#"{"id":"q2","error":{"message":"bad rules"}}"#).unwrap();
        assert_eq!(nested.error().as_deref(), Some("bad rules"));

        let odd = decode_line(r#"{"id":"q3","error":{"code":7}}"#).unwrap();
        assert_eq!(odd.error().as_deref(), Some(r#"{"code":7}"#));
        assert!(odd.is_final());
    }

    #[test]
    fn test_progress_lines_are_not_final() {
        let partial = decode_line(r#"{"id":"q1","isDuringSearch":true,"moveInfos":[]}"#).unwrap();
        assert!(!partial.is_final());

        let warning = decode_line(r#"{"id":"q1","warning":"unused field"}"#).unwrap();
        assert!(!warning.is_final());

        let done = decode_line(r#"{"id":"q1","isDuringSearch":false}"#).unwrap();
        assert!(done.is_final());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        for line in ["not json", "[1,2]", r#"{"rootInfo":{}}"#, r#"{"id":5}"#, r#"{"id":""}"#] {
            let err = decode_line(line).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{line}: {err}");
        }
    }

    #[test]
    fn test_probe_body() {
        let line = encode_request(&QueryId::probe(1), &probe_body()).unwrap();
        let decoded: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(decoded, json!({"id": "__probe_1", "action": "query_version"}));
    }

    #[test]
    fn test_default_visits_only_fill_gaps() {
        let filled = with_default_visits(Map::new(), 500);
        assert_eq!(filled["maxVisits"], json!(500));

        let explicit = with_default_visits(object(json!({"maxVisits": 20})), 500);
        assert_eq!(explicit["maxVisits"], json!(20));

        let action = with_default_visits(probe_body(), 500);
        assert!(!action.contains_key("maxVisits"));
    }

    #[tokio::test]
    async fn test_write_line_flushes_whole_line() {
        let mut buf: Vec<u8> = Vec::new();
        write_line(&mut buf, b"{\"id\":\"q1\"}\n").await.unwrap();
        assert_eq!(buf, b"{\"id\":\"q1\"}\n");
    }
}
