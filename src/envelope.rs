// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every message travelling over the bus is wrapped in an [`Envelope`] carrying
//! its identity, creation time, sender and the type tag used for routing. The
//! user payload is stored already serialized, so the envelope itself never needs
//! to know the concrete payload type.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// A type that can be carried inside an [`Envelope`].
///
/// The payload type name is part of the subscription key, so publisher and
/// subscriber must agree on it. By default it is the unqualified Rust type name;
/// override [`Payload::payload_type`] to pin it to a stable value.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn payload_type() -> String {
        short_type_name::<Self>().to_owned()
    }
}

/// Returns the last path segment of a type name without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Structured wrapper around a serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    created_at: DateTime<Utc>,
    sender: String,
    payload_type: String,
    payload: String,
}

impl Envelope {
    /// Serializes `payload` and wraps it in a new envelope with a fresh id.
    pub fn new<T: Payload>(sender: &str, payload: &T) -> Result<Envelope, AmqpError> {
        let payload = serde_json::to_string(payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        Ok(Envelope::from_raw(sender, &T::payload_type(), payload))
    }

    /// Wraps an already serialized payload verbatim.
    pub fn from_raw(sender: &str, payload_type: &str, payload: impl Into<String>) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            sender: sender.to_owned(),
            payload_type: payload_type.to_owned(),
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    /// The serialized inner payload, exactly as it was published.
    pub fn payload_json(&self) -> &str {
        &self.payload
    }

    /// Deserializes the inner payload.
    pub fn get_payload<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_str(&self.payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// UTF-8 JSON body sent to the broker.
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}
