//! JSON codec and newline framing.
//!
//! One message per line: encoders append a single `\n` to every message,
//! [`read_frame`] consumes a line up to and including it. The codec
//! validates the JSON-RPC envelope on both directions but leaves payloads
//! raw.
//!
//! # Example
//!
//! ```
//! use linerpc_common::codec::JsonCodec;
//! use linerpc_common::protocol::{Request, Id};
//!
//! let codec = JsonCodec::new();
//! let req = Request::new("Calc.Add", None, Id::Number(1));
//! let bytes = codec.encode_request(&req).unwrap();
//! let back = codec.decode_request(&bytes).unwrap();
//! assert_eq!(back.method, "Calc.Add");
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::arena::{default_pool, BufferPool};
use crate::protocol::{Error, ErrorObject, Request, Response, Result, JSONRPC_VERSION};

/// Upper bound on a single framed message. Lines past this indicate a
/// broken or hostile peer, not a legitimate payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one newline-terminated frame into `buf`, returning the number of
/// bytes read. Zero means clean EOF before any byte arrived.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n > MAX_FRAME_SIZE {
        return Err(Error::Rpc(ErrorObject::invalid_request(format!(
            "frame too large: {n} bytes (max {MAX_FRAME_SIZE})"
        ))));
    }
    if n > 0 && buf.last() != Some(&b'\n') {
        // Stream ended mid-line; the message is truncated.
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-frame",
        )));
    }
    Ok(n)
}

/// Encoder/decoder for JSON-RPC messages with envelope validation.
///
/// Scratch space for encoding comes from a [`BufferPool`]; the returned
/// message is always a freshly owned, newline-terminated byte vector.
pub struct JsonCodec {
    pool: &'static BufferPool,
}

impl JsonCodec {
    /// Create a codec backed by the process-wide buffer pool.
    pub fn new() -> Self {
        Self {
            pool: default_pool(),
        }
    }

    /// Create a codec backed by a caller-supplied pool.
    pub fn with_pool(pool: &'static BufferPool) -> Self {
        Self { pool }
    }

    /// Encode a request as one newline-terminated line.
    ///
    /// An empty version tag is defaulted to "2.0"; an empty method fails
    /// with `InvalidRequest`.
    pub fn encode_request(&self, req: &Request) -> Result<Vec<u8>> {
        if req.method.is_empty() {
            return Err(Error::Rpc(ErrorObject::invalid_request(
                "method is required",
            )));
        }

        let mut buf = self.pool.get();
        let result = if req.jsonrpc.is_empty() {
            let tagged = Request {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method: req.method.clone(),
                params: req.params.clone(),
                id: req.id.clone(),
            };
            serde_json::to_writer(&mut buf, &tagged)
        } else {
            serde_json::to_writer(&mut buf, req)
        };
        if let Err(err) = result {
            self.pool.put(buf);
            return Err(Error::Json(err));
        }
        buf.push(b'\n');

        // The scratch buffer goes back to the pool, so the caller gets a copy.
        let data = buf.clone();
        self.pool.put(buf);
        Ok(data)
    }

    /// Decode a request, validating version and method. The parameter
    /// payload stays raw.
    pub fn decode_request(&self, data: &[u8]) -> Result<Request> {
        if data.is_empty() {
            return Err(Error::Rpc(ErrorObject::invalid_request(
                "empty request data",
            )));
        }

        let req: Request = serde_json::from_slice(data)
            .map_err(|err| Error::Rpc(ErrorObject::parse_error(err.to_string())))?;

        if req.jsonrpc != JSONRPC_VERSION {
            return Err(Error::Rpc(ErrorObject::invalid_request(format!(
                "invalid jsonrpc version: {:?}",
                req.jsonrpc
            ))));
        }
        if req.method.is_empty() {
            return Err(Error::Rpc(ErrorObject::invalid_request(
                "method is required",
            )));
        }

        Ok(req)
    }

    /// Encode a response as one newline-terminated line.
    ///
    /// Exactly one of result and error must be populated; anything else is
    /// an internal error on the sending side.
    pub fn encode_response(&self, resp: &Response) -> Result<Vec<u8>> {
        match (&resp.result, &resp.error) {
            (None, None) => {
                return Err(Error::Rpc(ErrorObject::internal_error(
                    "response must have either result or error",
                )));
            }
            (Some(_), Some(_)) => {
                return Err(Error::Rpc(ErrorObject::internal_error(
                    "response cannot have both result and error",
                )));
            }
            _ => {}
        }

        let mut buf = self.pool.get();
        let result = if resp.jsonrpc.is_empty() {
            let tagged = Response {
                jsonrpc: JSONRPC_VERSION.to_string(),
                result: resp.result.clone(),
                error: resp.error.clone(),
                id: resp.id.clone(),
            };
            serde_json::to_writer(&mut buf, &tagged)
        } else {
            serde_json::to_writer(&mut buf, resp)
        };
        if let Err(err) = result {
            self.pool.put(buf);
            return Err(Error::Json(err));
        }
        buf.push(b'\n');

        let data = buf.clone();
        self.pool.put(buf);
        Ok(data)
    }

    /// Decode a response, validating version and the exactly-one-of
    /// (result, error) invariant. The result payload stays raw.
    pub fn decode_response(&self, data: &[u8]) -> Result<Response> {
        if data.is_empty() {
            return Err(Error::Rpc(ErrorObject::invalid_request(
                "empty response data",
            )));
        }

        let resp: Response = serde_json::from_slice(data)
            .map_err(|err| Error::Rpc(ErrorObject::parse_error(err.to_string())))?;

        if resp.jsonrpc != JSONRPC_VERSION {
            return Err(Error::Rpc(ErrorObject::invalid_request(format!(
                "invalid jsonrpc version: {:?}",
                resp.jsonrpc
            ))));
        }
        match (&resp.result, &resp.error) {
            (None, None) => Err(Error::Rpc(ErrorObject::invalid_request(
                "response must have either result or error",
            ))),
            (Some(_), Some(_)) => Err(Error::Rpc(ErrorObject::invalid_request(
                "response cannot have both result and error",
            ))),
            _ => Ok(resp),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Id, INVALID_REQUEST, PARSE_ERROR};
    use serde_json::value::to_raw_value;
    use serde_json::json;

    fn codec() -> JsonCodec {
        JsonCodec::new()
    }

    fn rpc_code(err: Error) -> i64 {
        err.rpc_code().expect("expected an rpc error")
    }

    #[test]
    fn test_request_round_trip() {
        let params = to_raw_value(&json!({"a": 10, "b": 20})).unwrap();
        let req = Request::new("TestService.Add", Some(params), Id::Number(3));

        let encoded = codec().encode_request(&req).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));

        let back = codec().decode_request(&encoded).unwrap();
        assert_eq!(back.jsonrpc, "2.0");
        assert_eq!(back.method, req.method);
        assert_eq!(back.id, req.id);
        assert_eq!(back.params.unwrap().get(), r#"{"a":10,"b":20}"#);
    }

    #[test]
    fn test_encode_request_defaults_version() {
        let req = Request {
            jsonrpc: String::new(),
            method: "Svc.M".into(),
            params: None,
            id: Id::Number(1),
        };
        let encoded = codec().encode_request(&req).unwrap();
        let back = codec().decode_request(&encoded).unwrap();
        assert_eq!(back.jsonrpc, "2.0");
    }

    #[test]
    fn test_encode_request_rejects_empty_method() {
        let req = Request::new("", None, Id::Number(1));
        let err = codec().encode_request(&req).unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_decode_request_rejects_bad_json() {
        let err = codec().decode_request(b"{not json}\n").unwrap_err();
        assert_eq!(rpc_code(err), PARSE_ERROR);
    }

    #[test]
    fn test_decode_request_rejects_wrong_version() {
        let raw = br#"{"jsonrpc":"1.0","method":"Svc.M","id":1}"#;
        let err = codec().decode_request(raw).unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_decode_request_rejects_missing_method() {
        let raw = br#"{"jsonrpc":"2.0","id":1}"#;
        let err = codec().decode_request(raw).unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_decode_request_rejects_empty_input() {
        let err = codec().decode_request(b"").unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_response_round_trip() {
        let result = to_raw_value(&json!({"result": 30})).unwrap();
        let resp = Response::success(Id::Number(3), result);

        let encoded = codec().encode_response(&resp).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));

        let back = codec().decode_response(&encoded).unwrap();
        assert_eq!(back.id, Id::Number(3));
        assert_eq!(back.result.unwrap().get(), r#"{"result":30}"#);
        assert!(back.error.is_none());
    }

    #[test]
    fn test_error_response_round_trip() {
        let resp = Response::error(Id::String("abc".into()), ErrorObject::invalid_params("bad"));
        let encoded = codec().encode_response(&resp).unwrap();
        let back = codec().decode_response(&encoded).unwrap();
        assert_eq!(back.id, Id::String("abc".into()));
        assert_eq!(back.error.unwrap().code, -32602);
    }

    #[test]
    fn test_encode_response_rejects_neither() {
        let resp = Response {
            jsonrpc: "2.0".into(),
            result: None,
            error: None,
            id: Id::Number(1),
        };
        let err = codec().encode_response(&resp).unwrap_err();
        assert_eq!(rpc_code(err), -32603);
    }

    #[test]
    fn test_encode_response_rejects_both() {
        let resp = Response {
            jsonrpc: "2.0".into(),
            result: Some(to_raw_value(&json!(1)).unwrap()),
            error: Some(ErrorObject::internal_error("x")),
            id: Id::Number(1),
        };
        let err = codec().encode_response(&resp).unwrap_err();
        assert_eq!(rpc_code(err), -32603);
    }

    #[test]
    fn test_decode_response_rejects_neither() {
        let raw = br#"{"jsonrpc":"2.0","id":1}"#;
        let err = codec().decode_response(raw).unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_decode_response_rejects_both() {
        let raw = br#"{"jsonrpc":"2.0","result":1,"error":{"code":-32603,"message":"x"},"id":1}"#;
        let err = codec().decode_response(raw).unwrap_err();
        assert_eq!(rpc_code(err), INVALID_REQUEST);
    }

    #[test]
    fn test_special_characters_survive_framing() {
        let messages = [
            "Hello, 世界!",
            r#"{"nested": "json"}"#,
            "Line1\nLine2\nLine3",
            "Tab\tSeparated\tValues",
            r#"Quote: "test""#,
        ];
        for msg in messages {
            let params = to_raw_value(&json!({ "message": msg })).unwrap();
            let req = Request::new("Echo.Say", Some(params), Id::Number(1));
            let encoded = codec().encode_request(&req).unwrap();

            // Embedded newlines must be escaped, never literal.
            assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);

            let back = codec().decode_request(&encoded).unwrap();
            let val: serde_json::Value =
                serde_json::from_str(back.params.unwrap().get()).unwrap();
            assert_eq!(val["message"], json!(msg));
        }
    }

    #[tokio::test]
    async fn test_read_frame_consumes_one_line() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut reader = tokio::io::BufReader::new(data);
        let mut buf = Vec::new();

        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"a\":1}\n");

        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"b\":2}\n");

        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_frame_truncated_line_is_an_error() {
        let data: &[u8] = b"{\"a\":1}";
        let mut reader = tokio::io::BufReader::new(data);
        let mut buf = Vec::new();
        let err = read_frame(&mut reader, &mut buf).await.unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }
}
