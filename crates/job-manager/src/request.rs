use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// A request to execute a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber: Option<Subscriber>,
}

impl ExecuteRequest {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            subscriber: None,
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscriber = Some(subscriber);
        self
    }
}

/// Webhook URLs that are notified about a job's progress and outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    /// Receives the job's results when it succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_uri: Option<Url>,
    /// Receives the job's status info when it fails or is dismissed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_uri: Option<Url>,
    /// Receives the job's status info on every progress report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_uri: Option<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    Success,
    Failed,
    InProgress,
}

impl Subscriber {
    pub(crate) fn url_for(&self, notification: Notification) -> Option<&Url> {
        match notification {
            Notification::Success => self.success_uri.as_ref(),
            Notification::Failed => self.failed_uri.as_ref(),
            Notification::InProgress => self.in_progress_uri.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_request() {
        let request: ExecuteRequest = serde_json::from_value(json!({
            "inputs": { "x": 3 },
            "subscriber": {
                "successUri": "http://localhost/done",
                "inProgressUri": "http://localhost/progress",
            },
        }))
        .unwrap();

        assert_eq!(request.inputs["x"], json!(3));
        let subscriber = request.subscriber.unwrap();
        assert_eq!(
            subscriber.url_for(Notification::Success).map(Url::as_str),
            Some("http://localhost/done")
        );
        assert_eq!(subscriber.url_for(Notification::Failed), None);
        assert_eq!(
            subscriber.url_for(Notification::InProgress).map(Url::as_str),
            Some("http://localhost/progress")
        );
    }

    #[test]
    fn inputs_default_to_empty() {
        let request: ExecuteRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request, ExecuteRequest::default());
    }

    #[test]
    fn invalid_subscriber_url() {
        let result = serde_json::from_value::<ExecuteRequest>(json!({
            "subscriber": { "failedUri": "not a url" },
        }));
        assert!(result.is_err());
    }
}
