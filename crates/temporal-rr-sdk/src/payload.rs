// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload lists and the data converter boundary.
//!
//! Payload values are always JSON on the wire. A [`DataConverter`] decides
//! how a user value maps to such a value; [`JsonConverter`] is the default
//! used by [`Payloads::encode`] and [`Payloads::decode`], and the `_with`
//! variants take any other converter.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;

/// Converts user values to and from wire payload values.
pub trait DataConverter {
    fn to_payload<T: Serialize>(value: &T) -> Result<Value, WorkflowError>;

    fn from_payload<T: DeserializeOwned>(value: Value) -> Result<T, WorkflowError>;
}

/// JSON data converter.
pub struct JsonConverter;

impl DataConverter for JsonConverter {
    fn to_payload<T: Serialize>(value: &T) -> Result<Value, WorkflowError> {
        Ok(serde_json::to_value(value)?)
    }

    fn from_payload<T: DeserializeOwned>(value: Value) -> Result<T, WorkflowError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Ordered list of payload values carried by commands and responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payloads(Vec<Value>);

impl Payloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-value payload list.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, WorkflowError> {
        Self::encode_with::<JsonConverter, T>(value)
    }

    pub fn encode_with<C: DataConverter, T: Serialize>(value: &T) -> Result<Self, WorkflowError> {
        Ok(Self(vec![C::to_payload(value)?]))
    }

    pub fn push<T: Serialize>(&mut self, value: &T) -> Result<(), WorkflowError> {
        self.push_with::<JsonConverter, T>(value)
    }

    pub fn push_with<C: DataConverter, T: Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), WorkflowError> {
        self.0.push(C::to_payload(value)?);
        Ok(())
    }

    pub fn with<T: Serialize>(mut self, value: &T) -> Result<Self, WorkflowError> {
        self.push(value)?;
        Ok(self)
    }

    /// Decode the value at `index`. A missing value decodes from `null`.
    pub fn decode<T: DeserializeOwned>(&self, index: usize) -> Result<T, WorkflowError> {
        self.decode_with::<JsonConverter, T>(index)
    }

    pub fn decode_with<C: DataConverter, T: DeserializeOwned>(
        &self,
        index: usize,
    ) -> Result<T, WorkflowError> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        C::from_payload(value)
    }

    pub fn first_value(&self) -> Value {
        self.0.first().cloned().unwrap_or(Value::Null)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for Payloads {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Payloads> for Vec<Value> {
    fn from(payloads: Payloads) -> Self {
        payloads.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_and_decode_positions() {
        let payloads = Payloads::encode(&"Ada").unwrap().with(&42).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads.decode::<String>(0).unwrap(), "Ada");
        assert_eq!(payloads.decode::<u32>(1).unwrap(), 42);
    }

    /// Absent positions decode like JSON null, so optional arguments work.
    #[test]
    fn test_missing_value_decodes_from_null() {
        let payloads = Payloads::new();
        assert_eq!(payloads.decode::<Option<u32>>(0).unwrap(), None);
        assert!(payloads.decode::<u32>(0).is_err());
        assert_eq!(payloads.first_value(), Value::Null);
    }

    /// Wraps every value in an envelope naming its encoding.
    struct EnvelopeConverter;

    impl DataConverter for EnvelopeConverter {
        fn to_payload<T: Serialize>(value: &T) -> Result<Value, WorkflowError> {
            Ok(json!({"encoding": "json/envelope", "data": serde_json::to_value(value)?}))
        }

        fn from_payload<T: DeserializeOwned>(mut value: Value) -> Result<T, WorkflowError> {
            if value["encoding"] != "json/envelope" {
                return Err(WorkflowError::InvalidArgument("not an envelope".into()));
            }
            Ok(serde_json::from_value(value["data"].take())?)
        }
    }

    #[test]
    fn test_custom_converter() {
        let mut payloads = Payloads::encode_with::<EnvelopeConverter, _>(&"Ada").unwrap();
        payloads.push_with::<EnvelopeConverter, _>(&7).unwrap();
        assert_eq!(payloads.values()[1], json!({"encoding": "json/envelope", "data": 7}));

        let name: String = payloads.decode_with::<EnvelopeConverter, _>(0).unwrap();
        assert_eq!(name, "Ada");
        assert!(Payloads::encode(&1).unwrap().decode_with::<EnvelopeConverter, u32>(0).is_err());
    }

    /// Payloads serialize as a bare JSON array.
    #[test]
    fn test_transparent_serialization() {
        let payloads = Payloads::from(vec![json!(1), json!("two")]);
        assert_eq!(serde_json::to_value(&payloads).unwrap(), json!([1, "two"]));
    }
}
