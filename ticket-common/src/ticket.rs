use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("failed to decode payload: {0}")]
    DecodingError(String),
    #[error("failed to parse ticket: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("ticket payload is not a JSON object")]
    NotAnObject,
}

/// One ticket purchase submission, as delivered on the queue.
///
/// Every field is optional at the parse level: absent fields take the type's
/// default rather than failing the message. No semantic validation happens
/// here, the record is stored as submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
#[serde(default)]
pub struct Ticket {
    #[serde(rename = "concertid")]
    pub concert_id: i32,
    pub email: String,
    pub name: String,
    pub phone: String,
    pub quantity: i32,
    #[serde(rename = "creditcard")]
    pub credit_card: String,
    pub expiration: String,
    #[serde(rename = "securitycode")]
    pub security_code: String,
    pub address: String,
    pub city: String,
    pub province: String,
    #[serde(rename = "postalcode")]
    pub postal_code: String,
    pub country: String,
}

impl Ticket {
    /// Decode and parse one queue payload into a Ticket.
    pub fn from_bytes(bytes: &[u8]) -> Result<Ticket, PayloadError> {
        tracing::debug!(len = bytes.len(), "decoding new ticket payload");

        let text = decode_payload(bytes)?;

        Ticket::from_json(&text)
    }

    /// Parse a Ticket out of a JSON document, matching top-level keys
    /// case-insensitively. Unknown keys are ignored.
    pub fn from_json(text: &str) -> Result<Ticket, PayloadError> {
        let document: Value = serde_json::from_str(text)?;

        let fields = match document {
            Value::Object(fields) => fields,
            _ => return Err(PayloadError::NotAnObject),
        };

        // serde has no case-insensitive container attribute, so keys are
        // lowercased up front to match the lowercase serde names on Ticket.
        let normalized = fields
            .into_iter()
            .map(|(key, value)| (key.to_lowercase(), value))
            .collect();

        Ok(serde_json::from_value(Value::Object(normalized))?)
    }
}

/// Turn a raw queue payload into UTF-8 JSON text.
///
/// Producers deliver either plain JSON or its Base64 rendition, so decoding is
/// one fixed policy: attempt a standard-alphabet Base64 decode of the whole
/// payload, and fall back to reading the original bytes as UTF-8 when the
/// payload is not Base64. A JSON object always takes the fallback path, since
/// `{` is not in the Base64 alphabet.
pub fn decode_payload(bytes: &[u8]) -> Result<String, PayloadError> {
    match base64::engine::general_purpose::STANDARD.decode(bytes) {
        Ok(decoded) => String::from_utf8(decoded).map_err(|e| {
            tracing::error!("failed to decode Base64 payload: {}", e);
            PayloadError::DecodingError(String::from("Base64 payload is not valid UTF-8"))
        }),
        Err(_) => match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_owned()),
            Err(e) => {
                tracing::error!("failed to decode payload: {}", e);
                Err(PayloadError::DecodingError(String::from(
                    "payload is not valid UTF-8",
                )))
            }
        },
    }
}
