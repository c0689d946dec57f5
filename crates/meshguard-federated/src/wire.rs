//! Length-prefixed framing for the client transport
//!
//! Payloads are bincode-encoded and framed with a u32 big-endian length so
//! they can travel over any byte stream the host provides.

use crate::types::{ClientUpdate, TrainingConfig};
use meshguard_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single frame; anything larger is treated as corrupt
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

fn encode_frame<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let body =
        bincode::serialize(payload).map_err(|e| Error::Integrity(format!("encode: {}", e)))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::Integrity(format!(
            "frame of {} bytes exceeds the {} byte cap",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < 4 {
        return Err(Error::Integrity("frame shorter than its length prefix".into()));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared > MAX_FRAME_BYTES {
        return Err(Error::Integrity(format!(
            "declared frame length {} exceeds the cap",
            declared
        )));
    }
    let body = &frame[4..];
    if body.len() != declared {
        return Err(Error::Integrity(format!(
            "frame body is {} bytes, prefix declared {}",
            body.len(),
            declared
        )));
    }
    bincode::deserialize(body).map_err(|e| Error::Integrity(format!("decode: {}", e)))
}

pub fn encode_update(update: &ClientUpdate) -> Result<Vec<u8>> {
    encode_frame(update)
}

pub fn decode_update(frame: &[u8]) -> Result<ClientUpdate> {
    decode_frame(frame)
}

pub fn encode_training_config(config: &TrainingConfig) -> Result<Vec<u8>> {
    encode_frame(config)
}

pub fn decode_training_config(frame: &[u8]) -> Result<TrainingConfig> {
    decode_frame(frame)
}
