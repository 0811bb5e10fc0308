//! Pub/sub wire payloads.

use facet::Facet;

/// One published sample: the payload of the reserved `publish` command.
///
/// Topics are opaque strings; subscriber matching is exact equality.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub data: String,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}
