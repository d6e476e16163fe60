use std::{any::type_name, fmt::Debug};

use serde::de::DeserializeOwned;

use crate::driver::Error;

pub fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::EncodeFailed {
        source: anyhow::anyhow!(
            "error serializing into json: {}, type: {}, value: {:?}",
            e,
            type_name::<T>(),
            value
        ),
    })
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::DecodeFailed {
        source: anyhow::anyhow!(
            "error deserializing from json bytes: {}, type: {}",
            e,
            type_name::<T>()
        ),
    })
}
