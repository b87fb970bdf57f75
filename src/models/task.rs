use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ProxyEndpoint;

/// HTTP method of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<HttpMethod> for http::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

/// A caller-supplied network job
///
/// `timeout` and `max_retries` fall back to the fleet defaults when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTask {
    pub task_id: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    /// Per-attempt deadline, in seconds on the wire
    #[serde(default, with = "opt_duration_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl HttpTask {
    pub fn new(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Final outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    /// Proxy of the last attempt, absent only if no attempt was made
    pub proxy_used: Option<ProxyEndpoint>,
    /// The HTTP exchange completed through the tunnel, whatever the status
    pub is_success: bool,
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Bytes>,
    pub response_time: Duration,
    pub error_message: Option<String>,
    pub attempts: u32,
}

impl TaskResult {
    /// Response body as UTF-8 text, if any
    pub fn text(&self) -> Option<String> {
        self.response_data
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Aggregate statistics over a batch of results
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean response time of successful tasks
    pub avg_response_time: Option<Duration>,
    pub status_codes: BTreeMap<u16, usize>,
}

impl TaskSummary {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let mut summary = TaskSummary {
            total: results.len(),
            ..Default::default()
        };
        let mut total_time = Duration::ZERO;

        for result in results {
            if result.is_success {
                summary.succeeded += 1;
                total_time += result.response_time;
            } else {
                summary.failed += 1;
            }
            if let Some(code) = result.status_code {
                *summary.status_codes.entry(code).or_insert(0) += 1;
            }
        }

        if summary.succeeded > 0 {
            summary.avg_response_time = Some(total_time / summary.succeeded as u32);
        }
        summary
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_f64(d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!(
                "timeout must be a positive number of seconds, got {}",
                s
            ))),
            None => Ok(None),
        }
    }
}
