use std::any::type_name;

use serde::{de::DeserializeOwned, Serialize};

use crate::driver::Error;

pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec_pretty(value).map_err(|e| Error::JsonEncoderFailed {
            source: anyhow::anyhow!("error serializing {} into json: {}", type_name::<T>(), e),
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::JsonDecoderFailed {
            source: anyhow::anyhow!("error deserializing {} from json: {}", type_name::<T>(), e),
        })
    }
}
