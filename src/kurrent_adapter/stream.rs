use bytes::Bytes;

use crate::RootContextIdentifier;

/// The KurrentDB stream holding every record of one root context on one topic.
///
/// Named `<topic>-<root-context>`, so ordering within a root context is the
/// stream's own revision order.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ContextStreamName {
    topic: String,
    root_context: RootContextIdentifier,
}

impl ContextStreamName {
    pub fn new(topic: impl Into<String>, root_context: RootContextIdentifier) -> Self {
        Self {
            topic: topic.into(),
            root_context,
        }
    }
}

impl std::fmt::Display for ContextStreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.root_context)
    }
}

impl eventstore::StreamName for ContextStreamName {
    fn into_stream_name(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}
