//! OTP delivery over SMTP.

use crate::config::SmtpConfig;
use lettre::{
    message::MultiPart,
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use std::future::Future;
use thiserror::Error;

const OTP_SUBJECT: &str = "Your Rollcall OTP";

#[derive(Error, Debug)]
pub enum MailError {
    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),
    #[error("failed to build message: {0}")]
    MessageBuild(#[from] lettre::error::Error),
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
}

/// Sends one-time passcodes to an address.
pub trait OtpMailer: Send + Sync + 'static {
    fn send_otp(&self, to: &str, code: &str) -> impl Future<Output = Result<(), MailError>> + Send;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl SmtpMailer {
    /// STARTTLS relay on the configured host and port, authenticated as the
    /// sender account.
    pub fn new(config: &SmtpConfig) -> Result<Self, SmtpError> {
        let credentials = Credentials::new(
            config.sender.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(credentials)
            .build();
        Ok(Self {
            transport,
            sender: config.sender.clone(),
        })
    }
}

impl OtpMailer for SmtpMailer {
    fn send_otp(&self, to: &str, code: &str) -> impl Future<Output = Result<(), MailError>> + Send {
        let message = otp_message(&self.sender, to, code);
        let transport = self.transport.clone();
        async move {
            transport.send(message?).await?;
            Ok(())
        }
    }
}

fn otp_message(from: &str, to: &str, code: &str) -> Result<Message, MailError> {
    let html = format!("<h2>OTP Verification</h2><p>Your OTP is <b>{code}</b>.</p>");
    let text = format!("Your OTP is {code}.");
    let message = Message::builder()
        .from(
            from.parse()
                .map_err(|_| MailError::InvalidAddress(from.to_string()))?,
        )
        .to(to
            .parse()
            .map_err(|_| MailError::InvalidAddress(to.to_string()))?)
        .subject(OTP_SUBJECT)
        .multipart(MultiPart::alternative_plain_html(text, html))?;
    Ok(message)
}
