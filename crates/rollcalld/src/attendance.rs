//! Attendance deduplication and dispatch.
//!
//! A recognition counts at most once per cooldown window per employee id.
//! Counted events are posted to the attendance form on the tokio runtime;
//! the outcome goes to the observer and never back into the cooldown table.

use crate::config::FormConfig;
use crate::observer::{Notification, NotificationKind, Observer};
use chrono::{DateTime, Local};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use rollcall_core::Identity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;

// --- Named constants ---

/// How long recognition and dispatch messages stay on screen.
const MESSAGE_DURATION: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("endpoint answered {status}")]
    Rejected { status: u16 },
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// employee id → instant of the last counted recognition.
pub struct CooldownTable {
    last: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Check-and-set: returns `true` and records `now` iff `employee_id` has
    /// never been dispatched or its last dispatch is older than the window.
    pub fn should_dispatch(&self, employee_id: &str, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match last.get(employee_id) {
            Some(&at) => now.saturating_duration_since(at) > self.window,
            None => true,
        };
        if fresh {
            last.insert(employee_id.to_string(), now);
        }
        fresh
    }

    #[cfg(test)]
    pub fn last_dispatch(&self, employee_id: &str) -> Option<Instant> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(employee_id)
            .copied()
    }
}

/// One attendance row as submitted to the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub name: String,
    pub employee_id: String,
    /// `dd/mm/yyyy`
    pub date: String,
    /// `HH:MM:SS`
    pub time: String,
}

impl AttendanceRecord {
    pub fn new(identity: &Identity, at: DateTime<Local>) -> Self {
        Self {
            name: identity.title_name(),
            employee_id: identity.employee_id.clone(),
            date: at.format("%d/%m/%Y").to_string(),
            time: at.format("%H:%M:%S").to_string(),
        }
    }
}

/// HTTP client bound to the configured attendance form.
pub struct FormEndpoint {
    http: reqwest::Client,
    config: FormConfig,
}

impl FormEndpoint {
    pub fn new(config: FormConfig) -> Result<Self, DispatchError> {
        let mut headers = HeaderMap::new();
        if !config.referer.is_empty() {
            let referer = HeaderValue::from_str(&config.referer)
                .map_err(|_| DispatchError::Config("invalid referer".into()))?;
            headers.insert(REFERER, referer);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .build()?;

        Ok(Self { http, config })
    }

    /// Post `record`. A 2xx or 3xx answer counts as accepted.
    pub async fn submit(&self, record: &AttendanceRecord) -> Result<u16, DispatchError> {
        if self.config.post_url.is_empty() {
            return Err(DispatchError::Config("no form URL configured".into()));
        }
        let fields = [
            (self.config.field_name.as_str(), record.name.as_str()),
            (self.config.field_employee_id.as_str(), record.employee_id.as_str()),
            (self.config.field_date.as_str(), record.date.as_str()),
            (self.config.field_time.as_str(), record.time.as_str()),
        ];

        let resp = self
            .http
            .post(&self.config.post_url)
            .form(&fields)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(status.as_u16())
        } else {
            Err(DispatchError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Result of feeding one recognition through the cooldown table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Dispatched,
    CoolingDown,
}

pub struct Attendance {
    cooldown: CooldownTable,
    /// employee id → last "already recorded" notice, so a face held in
    /// view produces one notice per message duration instead of one per frame.
    notices: Mutex<HashMap<String, Instant>>,
    endpoint: Arc<FormEndpoint>,
    runtime: Handle,
    observer: Arc<dyn Observer>,
}

impl Attendance {
    pub fn new(
        cooldown: Duration,
        endpoint: FormEndpoint,
        runtime: Handle,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            cooldown: CooldownTable::new(cooldown),
            notices: Mutex::new(HashMap::new()),
            endpoint: Arc::new(endpoint),
            runtime,
            observer,
        }
    }

    /// Handle a confident recognition seen at `now`. Safe to call from any
    /// thread; never waits on the network.
    pub fn on_recognized(&self, identity: &Identity, now: Instant) -> Outcome {
        let name = identity.title_name();
        if !self.cooldown.should_dispatch(&identity.employee_id, now) {
            if self.notice_due(&identity.employee_id, now) {
                self.observer.notify(Notification::new(
                    NotificationKind::Cooldown,
                    format!("Attendance already recorded for {name}."),
                    MESSAGE_DURATION,
                ));
            }
            return Outcome::CoolingDown;
        }

        self.observer.notify(Notification::new(
            NotificationKind::Recognized,
            format!("Attendance recorded for {name}!"),
            MESSAGE_DURATION,
        ));
        self.dispatch(AttendanceRecord::new(identity, Local::now()));
        Outcome::Dispatched
    }

    fn notice_due(&self, employee_id: &str, now: Instant) -> bool {
        let mut notices = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        let due = notices
            .get(employee_id)
            .map_or(true, |&at| now.saturating_duration_since(at) >= MESSAGE_DURATION);
        if due {
            notices.insert(employee_id.to_string(), now);
        }
        due
    }

    #[cfg(test)]
    pub fn cooldown(&self) -> &CooldownTable {
        &self.cooldown
    }

    fn dispatch(&self, record: AttendanceRecord) {
        let endpoint = Arc::clone(&self.endpoint);
        let observer = Arc::clone(&self.observer);
        self.runtime.spawn(async move {
            match endpoint.submit(&record).await {
                Ok(status) => {
                    tracing::info!(employee_id = %record.employee_id, status, "attendance submitted");
                    observer.notify(Notification::new(
                        NotificationKind::DispatchSucceeded,
                        format!("Attendance submitted for {}!", record.name),
                        MESSAGE_DURATION,
                    ));
                }
                Err(e) => {
                    observer.notify(Notification::new(
                        NotificationKind::DispatchWarning,
                        format!("Attendance for {} was not submitted: {e}", record.name),
                        MESSAGE_DURATION,
                    ));
                }
            }
        });
    }
}
