//! Topic derivation for the device's broker namespace
//!
//! Every topic the device uses is derived from its identity string:
//! indications flow up on `ind/<id>/...`, commands flow down on `cmd/<id>/...`.

use thiserror::Error;

/// Prefix for device-to-cloud topics
pub const INDICATION_PREFIX: &str = "ind";
/// Prefix for cloud-to-device topics
pub const COMMAND_PREFIX: &str = "cmd";

/// Default topic capacity in bytes
pub const DEFAULT_MAX_TOPIC_LEN: usize = 64;

/// The complete set of topics derived for one device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub login: String,
    pub gps: String,
    pub generic: String,
    pub fota: String,
    pub psk: String,
}

impl Topics {
    /// Derive all topics for `identity`
    ///
    /// Derivation is deterministic. Any topic longer than `max_topic_len`
    /// fails the whole derivation; nothing is partially built.
    ///
    /// # Examples
    /// ```
    /// use trackerlink::protocol::Topics;
    ///
    /// let topics = Topics::derive("350457791234567", "data", 64).unwrap();
    /// assert_eq!(topics.gps, "ind/350457791234567/gps");
    /// assert_eq!(topics.fota, "cmd/350457791234567/fota");
    /// ```
    pub fn derive(
        identity: &str,
        generic_suffix: &str,
        max_topic_len: usize,
    ) -> Result<Self, TopicError> {
        validate_identity(identity)?;
        validate_suffix(generic_suffix)?;

        let build = |prefix: &str, leaf: &str| -> Result<String, TopicError> {
            let topic = format!("{prefix}/{identity}/{leaf}");
            if topic.len() > max_topic_len {
                return Err(TopicError::BufferTooSmall {
                    topic,
                    capacity: max_topic_len,
                });
            }
            Ok(topic)
        };

        Ok(Self {
            login: build(INDICATION_PREFIX, "login")?,
            gps: build(INDICATION_PREFIX, "gps")?,
            generic: build(INDICATION_PREFIX, generic_suffix)?,
            fota: build(COMMAND_PREFIX, "fota")?,
            psk: build(COMMAND_PREFIX, "psk")?,
        })
    }

    /// Command topics the device subscribes to after every connect
    pub fn command_topics(&self) -> Vec<String> {
        vec![self.fota.clone(), self.psk.clone()]
    }
}

fn validate_identity(identity: &str) -> Result<(), TopicError> {
    if identity.is_empty() {
        return Err(TopicError::InvalidIdentity(identity.to_string()));
    }
    if identity.contains(['/', '+', '#']) || identity.chars().any(char::is_whitespace) {
        return Err(TopicError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

fn validate_suffix(suffix: &str) -> Result<(), TopicError> {
    if suffix.is_empty() || suffix.contains(['+', '#']) {
        return Err(TopicError::InvalidSuffix(suffix.to_string()));
    }
    Ok(())
}

/// Topic derivation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Device identity '{0}' cannot be used in a topic")]
    InvalidIdentity(String),
    #[error("Topic suffix '{0}' cannot be used in a topic")]
    InvalidSuffix(String),
    #[error("Topic '{topic}' does not fit in {capacity} bytes")]
    BufferTooSmall { topic: String, capacity: usize },
}
