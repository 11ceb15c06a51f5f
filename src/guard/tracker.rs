//! Tracking key extraction.

use once_cell::sync::Lazy;
use regex::Regex;

use super::admission::AdmissionRequest;

static IPV4_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("IPv4 pattern is valid")
});

/// Derives the per-caller key a limiter counts against.
pub trait Tracker: Send + Sync {
    /// Return the tracking key, or `None` if the request carries none.
    fn track(&self, request: &AdmissionRequest<'_>) -> Option<String>;
}

/// Tracks callers by the first dotted-quad found in the request's IP field.
///
/// IPv4-mapped IPv6 addresses such as `::ffff:10.0.0.1` yield `10.0.0.1`.
/// Pure IPv6 addresses yield no key.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpTracker;

impl Tracker for IpTracker {
    fn track(&self, request: &AdmissionRequest<'_>) -> Option<String> {
        let ip = request.ip?;
        IPV4_PATTERN.find(ip).map(|m| m.as_str().to_string())
    }
}

/// Tracks callers by the value of a request header, e.g. an API key.
#[derive(Debug, Clone)]
pub struct HeaderTracker {
    name: String,
}

impl HeaderTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tracker for HeaderTracker {
    fn track(&self, request: &AdmissionRequest<'_>) -> Option<String> {
        request
            .headers?
            .get(self.name.as_str())?
            .to_str()
            .ok()
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

impl<F> Tracker for F
where
    F: Fn(&AdmissionRequest<'_>) -> Option<String> + Send + Sync,
{
    fn track(&self, request: &AdmissionRequest<'_>) -> Option<String> {
        self(request)
    }
}
