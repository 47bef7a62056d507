//! LISTEN/NOTIFY notifications.

use crate::encoding::Encoding;
use crate::error::Result;
use crate::state::RawNotification;

/// A notification received on a channel the session listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub channel: String,
    pub payload: String,
    /// PID of the backend that sent the notification
    pub pid: u32,
}

impl Notify {
    pub(crate) fn decode(raw: &RawNotification, encoding: Encoding) -> Result<Self> {
        Ok(Self {
            channel: encoding.decode(&raw.channel)?,
            payload: encoding.decode(&raw.payload)?,
            pid: raw.pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_latin1_payload() {
        let raw = RawNotification {
            pid: 3,
            channel: b"ch".to_vec(),
            payload: vec![0x63, 0x61, 0x66, 0xe9],
        };
        let n = Notify::decode(&raw, Encoding::Latin1).unwrap();
        assert_eq!(n.payload, "café");
        assert!(Notify::decode(&raw, Encoding::Utf8).is_err());
    }
}
