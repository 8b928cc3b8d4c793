//! Protocol definition for the camera data socket.
//!
//! Every message travels as one length-delimited frame carrying a
//! bincode-encoded `ProtoMsg`.
use serde::{Deserialize, Serialize};

/// Definition of protocol messages.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtoMsg {
    /// First message of a connection, announces the camera.
    Hello { camera_id: String },
    /// A single JPEG-encoded frame.
    Frame(FrameMsg),
    /// Graceful end of the stream.
    Bye,
}

/// Frame message.
#[derive(Debug, Default, Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameMsg {
    pub camera_id: String,
    /// Capture time in milliseconds since the unix epoch.
    pub timestamp_ms: u64,
    pub jpeg: Vec<u8>,
}

impl FrameMsg {
    pub fn new(camera_id: String, timestamp_ms: u64, jpeg: Vec<u8>) -> Self {
        Self {
            camera_id,
            timestamp_ms,
            jpeg,
        }
    }
}

impl ProtoMsg {
    pub fn serialize(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_frame_msg_bincode() -> Result<(), Error> {
        let msg = ProtoMsg::Frame(FrameMsg::new("CAM-01".into(), 1_700_000_000_000, vec![1, 2, 3]));

        let serialized = msg.serialize()?;
        let deserialized = ProtoMsg::deserialize(&serialized[..])?;

        assert_eq!(msg, deserialized);

        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ProtoMsg::deserialize(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
