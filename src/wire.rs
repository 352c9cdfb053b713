//! Wire encoding of varlink messages.
//!
//! A varlink message is one UTF-8 JSON object followed by a single NUL
//! byte on the wire. This module holds the two message shapes
//! ([`Request`] and [`Response`]) with their field-omission and defaulting
//! rules, and the [`FrameDecoder`] that slices NUL-delimited frames out of
//! an arbitrary sequence of byte chunks. Nothing in here performs I/O.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;
use crate::Result;

/// The parameter payload of a request or response: a JSON object.
pub type Parameters = serde_json::Map<String, Value>;

fn is_false(v: &bool) -> bool {
    !*v
}

/// One outbound call.
///
/// `parameters` is omitted on the wire when empty and the flags are omitted
/// when false; decoding restores the defaults, so absent == false/empty.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "is_false")]
    pub oneway: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub more: bool,
    /// Reserved for protocol upgrade; carried but not interpreted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub upgrade: bool,
}

impl Request {
    /// A plain single-reply call request.
    pub fn new<S: Into<String>>(method: S, parameters: Parameters) -> Self {
        Request {
            method: method.into(),
            parameters,
            oneway: false,
            more: false,
            upgrade: false,
        }
    }
}

/// One reply to a call.
///
/// `error` distinguishes the two variants: absent means success, present
/// means an error reply. `continues` is only meaningful on success and is
/// read with [`Response::continues`], which defaults it to false; on the
/// error variant it stays absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continues: Option<bool>,
}

impl Response {
    /// A success reply. `continues` is only emitted on the wire when true.
    pub fn success(parameters: Parameters, continues: bool) -> Self {
        Response {
            parameters,
            error: None,
            continues: if continues { Some(true) } else { None },
        }
    }

    /// An error reply carrying the dotted error name and its detail fields.
    pub fn error<S: Into<String>>(name: S, parameters: Parameters) -> Self {
        Response {
            parameters,
            error: Some(name.into()),
            continues: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether more replies follow this one. Absent defaults to false.
    pub fn continues(&self) -> bool {
        self.continues.unwrap_or(false)
    }

    /// Split into success parameters or the typed service error.
    pub fn into_result(self) -> std::result::Result<Parameters, ServiceError> {
        match self.error {
            Some(name) => Err(ServiceError::new(name, self.parameters)),
            None => Ok(self.parameters),
        }
    }
}

impl From<ServiceError> for Response {
    fn from(e: ServiceError) -> Self {
        Response::error(e.name, e.parameters)
    }
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Convert a serializable value into a parameter object.
///
/// Unit structs serialize to JSON null and map to the empty object; any
/// other non-object value is a decode error.
pub fn to_parameters<T: Serialize>(value: &T) -> Result<Parameters> {
    match serde_json::to_value(value)? {
        Value::Null => Ok(Parameters::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// Convert a parameter object back into a typed value.
pub fn from_parameters<T: DeserializeOwned>(parameters: Parameters) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(parameters))?)
}

/// Accumulates raw byte chunks and yields complete NUL-delimited frames.
///
/// Each frame is the bytes of one message, without the trailing NUL. Frames
/// are yielded in arrival order; a chunk may complete any number of frames,
/// including zero. Correct for any chunk boundaries, down to one byte at a
/// time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    frames: VecDeque<Vec<u8>>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Feed one chunk of bytes into the decoder.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == 0) {
            let end = start + pos;
            self.frames.push_back(self.buf[start..end].to_vec());
            start = end + 1;
        }
        // Keep the unterminated tail for the next chunk.
        self.buf.drain(..start);
    }

    /// Take the oldest complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn request_with_defaults_encodes_method_only() {
        let request = Request::new("org.example.Ping", Parameters::new());
        let bytes = encode_request(&request).unwrap();
        assert_eq!(bytes, br#"{"method":"org.example.Ping"}"#);

        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.parameters.is_empty());
        assert!(!decoded.oneway && !decoded.more && !decoded.upgrade);
    }

    #[test]
    fn request_flags_and_parameters_encoded_when_set() {
        let mut request = Request::new("org.example.More", params(json!({"n": 3})));
        request.more = true;
        let bytes = encode_request(&request).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""more":true"#));
        assert!(text.contains(r#""parameters":{"n":3}"#));
        assert!(!text.contains("oneway"));
        assert!(!text.contains("upgrade"));

        assert_eq!(decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn response_success_final_encodes_parameters_only() {
        let response = Response::success(Parameters::new(), false);
        let bytes = encode_response(&response).unwrap();
        assert_eq!(bytes, br#"{"parameters":{}}"#);

        let decoded = decode_response(&bytes).unwrap();
        assert!(!decoded.is_error());
        assert!(!decoded.continues());
    }

    #[test]
    fn response_success_continuing_carries_continues() {
        let response = Response::success(params(json!({"x": 1})), true);
        let bytes = encode_response(&response).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""continues":true"#));

        let decoded = decode_response(&bytes).unwrap();
        assert!(decoded.continues());
        assert_eq!(decoded.parameters["x"], 1);
    }

    #[test]
    fn response_error_variant_never_carries_continues() {
        let response = Response::error(
            "org.example.Broken",
            params(json!({"reason": "busted"})),
        );
        let bytes = encode_response(&response).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(!text.contains("continues"));

        let decoded = decode_response(&bytes).unwrap();
        assert!(decoded.is_error());
        assert_eq!(decoded.continues, None);

        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.name, "org.example.Broken");
        assert_eq!(err.parameters["reason"], "busted");
    }

    #[test]
    fn decode_rejects_invalid_payloads() {
        assert!(decode_request(b"not json").is_err());
        assert!(decode_request(b"[1,2,3]").is_err());
        assert!(decode_response(b"\"string\"").is_err());
    }

    #[test]
    fn typed_parameter_conversions() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ping {
            ping: String,
        }
        #[derive(Serialize)]
        struct NoArgs;

        let p = to_parameters(&Ping {
            ping: "hello".into(),
        })
        .unwrap();
        assert_eq!(p["ping"], "hello");
        let back: Ping = from_parameters(p).unwrap();
        assert_eq!(back.ping, "hello");

        assert!(to_parameters(&NoArgs).unwrap().is_empty());
        assert!(to_parameters(&vec![1, 2, 3]).is_err());
    }

    #[test]
    fn decoder_yields_frame_without_terminator() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"method\":\"org.example.Ping\"}\0");
        assert_eq!(
            decoder.next_frame().unwrap(),
            b"{\"method\":\"org.example.Ping\"}"
        );
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_yields_multiple_frames_from_one_chunk() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"first\0second\0third");
        assert_eq!(decoder.next_frame().unwrap(), b"first");
        assert_eq!(decoder.next_frame().unwrap(), b"second");
        assert!(decoder.next_frame().is_none());

        decoder.push(b"\0");
        assert_eq!(decoder.next_frame().unwrap(), b"third");
    }

    #[test]
    fn decoder_buffers_until_terminator_arrives() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"method\":");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"\"org.example.Ping\"}");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"\0");
        assert_eq!(
            decoder.next_frame().unwrap(),
            b"{\"method\":\"org.example.Ping\"}"
        );
    }

    #[test]
    fn decoder_is_chunk_boundary_agnostic() {
        let payloads: Vec<&[u8]> = vec![b"a", b"{\"x\":1}", b"", b"longer payload with spaces"];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(p);
            stream.push(0);
        }

        // One byte at a time.
        let mut decoder = FrameDecoder::new();
        for b in &stream {
            decoder.push(std::slice::from_ref(b));
        }
        for p in &payloads {
            assert_eq!(decoder.next_frame().unwrap(), *p);
        }
        assert!(decoder.next_frame().is_none());

        // Uneven chunks.
        let mut decoder = FrameDecoder::new();
        for chunk in stream.chunks(3) {
            decoder.push(chunk);
        }
        for p in &payloads {
            assert_eq!(decoder.next_frame().unwrap(), *p);
        }
        assert!(decoder.next_frame().is_none());
    }
}
