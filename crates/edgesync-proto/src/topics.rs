//! Topic scheme.
//!
//! Every topic starts with an `@`-prefixed message type followed by the
//! endpoint id, e.g. `@update/{id}/nodes/n/objects/o/attributes/a`.

use edgesync_core::TopicAddress;

/// Topic builder and parser for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    endpoint_id: String,
}

impl TopicScheme {
    /// Create the scheme for `endpoint_id`.
    #[must_use]
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
        }
    }

    /// Endpoint id the scheme is bound to.
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Birth announcement.
    #[must_use]
    pub fn online(&self) -> String {
        format!("@online/{}", self.endpoint_id)
    }

    /// Last will.
    #[must_use]
    pub fn offline(&self) -> String {
        format!("@offline/{}", self.endpoint_id)
    }

    /// Node added after start.
    #[must_use]
    pub fn node_added(&self, node: &str) -> String {
        format!("@nodeAdded/{}/{node}", self.endpoint_id)
    }

    /// Node removed after start.
    #[must_use]
    pub fn node_removed(&self, node: &str) -> String {
        format!("@nodeRemoved/{}/{node}", self.endpoint_id)
    }

    /// Attribute update.
    #[must_use]
    pub fn update(&self, address: &TopicAddress) -> String {
        format!("@update/{address}")
    }

    /// Acknowledgement of a cloud set.
    #[must_use]
    pub fn did_set(&self, address: &TopicAddress) -> String {
        format!("@didSet/{address}")
    }

    /// Committed transaction.
    #[must_use]
    pub fn transaction(&self) -> String {
        format!("@transaction/{}", self.endpoint_id)
    }

    /// Replayed backlog.
    #[must_use]
    pub fn delayed(&self) -> String {
        format!("@delayed/{}", self.endpoint_id)
    }

    /// Log records.
    #[must_use]
    pub fn logs(&self) -> String {
        format!("@logs/{}", self.endpoint_id)
    }

    /// One line of job output.
    #[must_use]
    pub fn exec_output(&self, correlation_id: &str) -> String {
        format!("@execOutput/{}/{correlation_id}", self.endpoint_id)
    }

    /// Filter for attribute set requests.
    #[must_use]
    pub fn set_filter(&self) -> String {
        format!("@set/{}/#", self.endpoint_id)
    }

    /// Job execution requests.
    #[must_use]
    pub fn exec(&self) -> String {
        format!("@exec/{}", self.endpoint_id)
    }

    /// Log level change requests.
    #[must_use]
    pub fn logs_level(&self) -> String {
        format!("@logsLevel/{}", self.endpoint_id)
    }

    /// All inbound subscriptions, in subscription order.
    #[must_use]
    pub fn subscriptions(&self) -> [String; 3] {
        [self.set_filter(), self.exec(), self.logs_level()]
    }

    /// Classify an inbound topic.
    ///
    /// Returns `None` for topics that are not addressed to this endpoint.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<InboundTopic> {
        if let Some(path) = topic.strip_prefix("@set/") {
            let below = path.strip_prefix(self.endpoint_id.as_str())?;
            return below
                .starts_with('/')
                .then(|| InboundTopic::Set(path.to_string()));
        }
        if topic == self.exec() {
            return Some(InboundTopic::Exec);
        }
        if topic == self.logs_level() {
            return Some(InboundTopic::LogsLevel);
        }
        None
    }
}

/// Inbound message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// Set the attribute at the contained address
    Set(String),
    /// Execute a job
    Exec,
    /// Change the log level
    LogsLevel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_core::TopicAddress;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::new("dev1");
        let address = TopicAddress::node("dev1", "n1").object("o1").attribute("temp");

        assert_eq!(scheme.online(), "@online/dev1");
        assert_eq!(scheme.offline(), "@offline/dev1");
        assert_eq!(scheme.node_added("n1"), "@nodeAdded/dev1/n1");
        assert_eq!(
            scheme.update(&address),
            "@update/dev1/nodes/n1/objects/o1/attributes/temp"
        );
        assert_eq!(
            scheme.did_set(&address),
            "@didSet/dev1/nodes/n1/objects/o1/attributes/temp"
        );
        assert_eq!(scheme.delayed(), "@delayed/dev1");
        assert_eq!(scheme.exec_output("c-7"), "@execOutput/dev1/c-7");
        assert_eq!(
            scheme.subscriptions(),
            ["@set/dev1/#", "@exec/dev1", "@logsLevel/dev1"]
        );
    }

    #[test]
    fn topic_parsing() {
        let scheme = TopicScheme::new("dev1");

        assert_eq!(
            scheme.parse("@set/dev1/nodes/n1/attributes/a"),
            Some(InboundTopic::Set("dev1/nodes/n1/attributes/a".into()))
        );
        assert_eq!(scheme.parse("@exec/dev1"), Some(InboundTopic::Exec));
        assert_eq!(scheme.parse("@logsLevel/dev1"), Some(InboundTopic::LogsLevel));
    }

    #[test]
    fn foreign_topics_ignored() {
        let scheme = TopicScheme::new("dev1");

        assert_eq!(scheme.parse("@set/dev10/nodes/n1/attributes/a"), None);
        assert_eq!(scheme.parse("@set/dev1"), None);
        assert_eq!(scheme.parse("@exec/dev2"), None);
        assert_eq!(scheme.parse("@update/dev1/nodes/n1/attributes/a"), None);
    }
}
