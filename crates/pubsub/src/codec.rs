use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// How the JSON text of a payload is carried over the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Plain UTF-8 text.
    #[default]
    Utf8,

    /// Base64 (standard alphabet, padded) of the UTF-8 text.
    Base64,

    /// Lowercase hex of the UTF-8 text.
    Hex,
}

impl PayloadEncoding {
    fn wrap(self, text: String) -> Bytes {
        match self {
            Self::Utf8 => Bytes::from(text),
            Self::Base64 => Bytes::from(STANDARD.encode(text)),
            Self::Hex => Bytes::from(hex::encode(text)),
        }
    }

    fn unwrap(self, raw: &[u8]) -> Option<String> {
        let bytes = match self {
            Self::Utf8 => return std::str::from_utf8(raw).ok().map(ToOwned::to_owned),
            Self::Base64 => STANDARD.decode(raw).ok()?,
            Self::Hex => hex::decode(raw).ok()?,
        };

        String::from_utf8(bytes).ok()
    }
}

/// A message as delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// The payload parsed as JSON.
    Json(Value),

    /// The payload was text but not JSON.
    Text(String),

    /// Raw payload bytes (parsing disabled, or not representable as text).
    Bytes(Bytes),
}

impl Payload {
    /// Returns the parsed JSON value, if any.
    #[must_use]
    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the payload as text: unparsed text, or a JSON string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(Value::String(text)) | Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the raw bytes when parsing was skipped.
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    /// Returns an error if the payload does not have the shape of `T`.
    pub fn deserialize<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Text(text) => T::deserialize(Value::String(text.clone())),
            Self::Bytes(bytes) => serde_json::from_slice(bytes),
        }
    }
}

/// Encodes published values and decodes received ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadCodec {
    encoding: PayloadEncoding,
    parse: bool,
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(PayloadEncoding::default(), true)
    }
}

impl PayloadCodec {
    /// Creates a codec. When `parse` is false, received payloads are handed
    /// to listeners as raw bytes.
    #[must_use]
    pub const fn new(encoding: PayloadEncoding, parse: bool) -> Self {
        Self { encoding, parse }
    }

    /// Serializes a value for the wire.
    #[must_use]
    pub fn encode(&self, value: &Value) -> Bytes {
        self.encoding.wrap(value.to_string())
    }

    /// Decodes a received message. Never fails: anything that cannot be
    /// parsed falls back to its text, and then to its raw bytes.
    #[must_use]
    pub fn decode(&self, raw: &Bytes) -> Payload {
        if !self.parse {
            return Payload::Bytes(raw.clone());
        }

        let Some(text) = self.encoding.unwrap(raw) else {
            return Payload::Bytes(raw.clone());
        };

        match serde_json::from_str(&text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_utf8_carries_json_text() {
        let codec = PayloadCodec::default();

        let encoded = codec.encode(&json!({"comment": "This is amazing"}));
        assert_eq!(encoded, Bytes::from(r#"{"comment":"This is amazing"}"#));

        let decoded = codec.decode(&encoded);
        assert_eq!(decoded, Payload::Json(json!({"comment": "This is amazing"})));
    }

    #[test]
    fn test_non_json_text_falls_back_to_text() {
        let codec = PayloadCodec::default();

        let decoded = codec.decode(&Bytes::from("not { json"));

        assert_eq!(decoded, Payload::Text("not { json".to_string()));
        assert_eq!(decoded.as_text(), Some("not { json"));
    }

    #[test]
    fn test_invalid_utf8_falls_back_to_bytes() {
        let codec = PayloadCodec::default();
        let raw = Bytes::from_static(&[0xff, 0xfe, 0x00]);

        assert_eq!(codec.decode(&raw), Payload::Bytes(raw));
    }

    #[test]
    fn test_base64_encoding() {
        let codec = PayloadCodec::new(PayloadEncoding::Base64, true);

        let encoded = codec.encode(&json!("test"));
        assert_eq!(encoded, Bytes::from("InRlc3Qi"));
        assert_eq!(codec.decode(&encoded).as_text(), Some("test"));
    }

    #[test]
    fn test_hex_encoding() {
        let codec = PayloadCodec::new(PayloadEncoding::Hex, true);

        let encoded = codec.encode(&json!(42));
        assert_eq!(encoded, Bytes::from("3432"));
        assert_eq!(codec.decode(&encoded), Payload::Json(json!(42)));

        // Not hex at all: nothing to parse, hand over the raw bytes.
        let raw = Bytes::from("zz");
        assert_eq!(codec.decode(&raw), Payload::Bytes(raw));
    }

    #[test]
    fn test_parsing_disabled() {
        let codec = PayloadCodec::new(PayloadEncoding::Utf8, false);

        let decoded = codec.decode(&codec.encode(&json!("test")));

        assert_eq!(decoded.as_bytes(), Some(&Bytes::from("\"test\"")));
        assert_eq!(decoded.deserialize::<String>().unwrap(), "test");
    }

    #[test]
    fn test_deserialize_into_struct() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Comment {
            id: u32,
            body: String,
        }

        let payload = Payload::Json(json!({"id": 7, "body": "hi"}));

        assert_eq!(
            payload.deserialize::<Comment>().unwrap(),
            Comment {
                id: 7,
                body: "hi".to_string()
            }
        );
        assert!(Payload::Text("hi".to_string()).deserialize::<u32>().is_err());
    }
}
