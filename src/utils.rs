//! Utility functions for ID minting and serialization

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::EngineError;

// construct a unique entity id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// infallible variant for the fixed prefixes the engine mints itself
pub fn new_id(hrp: &str) -> String {
    let hrp = bech32::Hrp::parse_unchecked(hrp);
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .unwrap_or_else(|_| hex::encode(uuid7().as_bytes()))
}

// event ids are plain hex, they only need to be unique and cheap to compare
pub fn new_event_id() -> String {
    hex::encode(uuid7().as_bytes())
}

pub fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, EngineError> {
    minicbor::to_vec(value).map_err(|e| EngineError::Codec(e.to_string()))
}

pub fn from_cbor<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, EngineError> {
    minicbor::decode(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}

// recover the guard from a poisoned mutex rather than panicking the caller
pub(crate) fn lock_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
