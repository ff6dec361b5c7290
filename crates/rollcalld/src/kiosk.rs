//! Operator workflows: registration, OTP-gated photo updates, status.
//!
//! Every call validates its input and returns at once. Enrollment runs on
//! its own thread and OTP mail is sent on the runtime.

use crate::enrollment::{
    EnrollmentError, EnrollmentKind, EnrollmentRequest, EnrollmentSummary, Enroller,
};
use crate::mailer::{OtpMailer, SmtpMailer};
use crate::observer::{Notification, NotificationKind, Observer};
use crate::otp::OtpChallenges;
use rollcall_core::contacts::ContactsError;
use rollcall_core::types::{is_file_safe, normalize_employee_id};
use rollcall_core::{ContactDirectory, Identity, IdentityStore, StoreError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

const ERROR_MESSAGE_DURATION: Duration = Duration::from_secs(3);
const UNSAFE_FIELD_MESSAGE: &str =
    "name and employee id must not contain '/', '\\' or NUL, or start with '.'";

#[derive(Error, Debug)]
pub enum KioskError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("no email address on file for {0}")]
    EmailRequired(String),
    #[error("incorrect OTP")]
    IncorrectCode,
    #[error("no OTP has been requested for {0}")]
    NoPendingCode(String),
    #[error("No existing face found for this ID. Please register first.")]
    NotRegistered,
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("contact directory: {0}")]
    Contacts(#[from] ContactsError),
}

impl KioskError {
    /// Errors caused by what the operator typed rather than by the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::EmailRequired(_)
                | Self::IncorrectCode
                | Self::NoPendingCode(_)
                | Self::NotRegistered
        )
    }
}

/// Outcome of asking to update an employee's photos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    OtpSent,
    EmailRequired,
}

impl UpdateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtpSent => "otp-sent",
            Self::EmailRequired => "email-required",
        }
    }
}

/// Handle to a started enrollment session.
pub struct EnrollmentTicket {
    thread: JoinHandle<Result<EnrollmentSummary, EnrollmentError>>,
}

impl EnrollmentTicket {
    /// Block until the session ends.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn wait(self) -> Result<EnrollmentSummary, EnrollmentError> {
        self.thread.join().unwrap_or(Err(EnrollmentError::Aborted))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KioskSettings {
    pub register_samples: usize,
    pub update_samples: usize,
}

impl Default for KioskSettings {
    fn default() -> Self {
        Self {
            register_samples: 10,
            update_samples: 5,
        }
    }
}

pub struct Kiosk<M: OtpMailer = SmtpMailer> {
    store: Arc<IdentityStore>,
    contacts: Arc<ContactDirectory>,
    otp: OtpChallenges,
    mailer: Arc<M>,
    enroller: Arc<Enroller>,
    runtime: Handle,
    observer: Arc<dyn Observer>,
    settings: KioskSettings,
}

impl<M: OtpMailer> Kiosk<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<IdentityStore>,
        contacts: Arc<ContactDirectory>,
        mailer: M,
        enroller: Arc<Enroller>,
        runtime: Handle,
        observer: Arc<dyn Observer>,
        settings: KioskSettings,
    ) -> Self {
        Self {
            store,
            contacts,
            otp: OtpChallenges::new(),
            mailer: Arc::new(mailer),
            enroller,
            runtime,
            observer,
            settings,
        }
    }

    pub fn enroller(&self) -> &Enroller {
        &self.enroller
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    /// Register a new identity: record the email and capture a full sample set.
    pub fn register(
        &self,
        name: &str,
        employee_id: &str,
        email: &str,
    ) -> Result<EnrollmentTicket, KioskError> {
        if name.trim().is_empty() || employee_id.trim().is_empty() {
            return Err(KioskError::InvalidInput("name and employee id are required"));
        }
        if employee_id.contains('_') {
            return Err(KioskError::InvalidInput("employee id must not contain '_'"));
        }
        let email = validate_email(email)?;
        let identity = Identity::new(name, employee_id);
        if !identity.is_file_safe() {
            return Err(KioskError::InvalidInput(UNSAFE_FIELD_MESSAGE));
        }

        let claim = self.enroller.claim()?;
        self.contacts.save(&identity.employee_id, email)?;
        tracing::info!(employee_id = %identity.employee_id, "registration requested");
        let thread = self.enroller.launch(
            claim,
            EnrollmentRequest {
                identity,
                target: self.settings.register_samples,
                kind: EnrollmentKind::Register,
            },
        )?;
        Ok(EnrollmentTicket { thread })
    }

    /// First step of a photo update: send an OTP if an email is on file.
    pub fn request_update(&self, employee_id: &str) -> Result<UpdateStep, KioskError> {
        let employee_id = validate_employee_id(employee_id)?;
        match self.contacts.email_for(&employee_id) {
            Some(email) => {
                self.issue_and_send(&employee_id, &email)?;
                Ok(UpdateStep::OtpSent)
            }
            None => {
                tracing::info!(%employee_id, "no email on file, asking for one");
                Ok(UpdateStep::EmailRequired)
            }
        }
    }

    /// Record an email for `employee_id` and send it an OTP.
    pub fn submit_email(&self, employee_id: &str, email: &str) -> Result<(), KioskError> {
        let employee_id = validate_employee_id(employee_id)?;
        let email = validate_email(email)?;
        self.contacts.save(&employee_id, email)?;
        self.issue_and_send(&employee_id, email)
    }

    /// Check `code`; a match starts the photo update.
    pub fn verify_otp(&self, employee_id: &str, code: &str) -> Result<EnrollmentTicket, KioskError> {
        let employee_id = validate_employee_id(employee_id)?;
        let bound_name = self
            .otp
            .verify(&employee_id, code)
            .ok_or(KioskError::IncorrectCode)?;

        let identity = match bound_name {
            Some(name) => Identity::new(&name, &employee_id),
            None => match self.store.find_identity(&employee_id)? {
                Some(identity) => identity,
                None => {
                    self.observer.notify(Notification::new(
                        NotificationKind::Error,
                        KioskError::NotRegistered.to_string(),
                        ERROR_MESSAGE_DURATION,
                    ));
                    return Err(KioskError::NotRegistered);
                }
            },
        };
        self.start_enrollment(identity, self.settings.update_samples, EnrollmentKind::Update)
    }

    /// Replace the pending OTP and send the new one.
    pub fn resend_otp(&self, employee_id: &str) -> Result<(), KioskError> {
        let employee_id = validate_employee_id(employee_id)?;
        let email = self
            .contacts
            .email_for(&employee_id)
            .ok_or_else(|| KioskError::EmailRequired(employee_id.clone()))?;
        let code = self
            .otp
            .reissue(&employee_id)
            .ok_or_else(|| KioskError::NoPendingCode(employee_id.clone()))?;
        self.send(email, code);
        Ok(())
    }

    fn issue_and_send(&self, employee_id: &str, email: &str) -> Result<(), KioskError> {
        let bound_name = self
            .store
            .find_identity(employee_id)?
            .map(|identity| identity.display_name);
        let code = self.otp.issue(employee_id, bound_name);
        self.send(email.to_string(), code);
        Ok(())
    }

    fn send(&self, email: String, code: String) {
        let mailer = Arc::clone(&self.mailer);
        let observer = Arc::clone(&self.observer);
        self.runtime.spawn(async move {
            match mailer.send_otp(&email, &code).await {
                Ok(()) => {
                    tracing::info!(%email, "sent OTP");
                    observer.notify(Notification::new(
                        NotificationKind::EnrollmentProgress,
                        format!("OTP sent to {email}"),
                        ERROR_MESSAGE_DURATION,
                    ));
                }
                Err(e) => {
                    observer.notify(Notification::new(
                        NotificationKind::Error,
                        format!("Failed to send OTP to {email}: {e}"),
                        ERROR_MESSAGE_DURATION,
                    ));
                }
            }
        });
    }

    fn start_enrollment(
        &self,
        identity: Identity,
        target: usize,
        kind: EnrollmentKind,
    ) -> Result<EnrollmentTicket, KioskError> {
        let thread = self.enroller.start(EnrollmentRequest {
            identity,
            target,
            kind,
        })?;
        Ok(EnrollmentTicket { thread })
    }
}

fn validate_employee_id(raw: &str) -> Result<String, KioskError> {
    let employee_id = normalize_employee_id(raw);
    if employee_id.is_empty() {
        return Err(KioskError::InvalidInput("employee id cannot be empty"));
    }
    if !is_file_safe(&employee_id) {
        return Err(KioskError::InvalidInput(UNSAFE_FIELD_MESSAGE));
    }
    Ok(employee_id)
}

fn validate_email(raw: &str) -> Result<&str, KioskError> {
    let email = raw.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(KioskError::InvalidInput("a valid email address is required"));
    }
    Ok(email)
}
