//! One-time passcode challenges for photo updates.
//!
//! Codes are bound to an employee id and stay valid until replaced by a
//! newer one. They are not consumed by a successful verification.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCredential {
    code: String,
    bound_name: Option<String>,
}

#[derive(Default)]
pub struct OtpChallenges {
    pending: Mutex<HashMap<String, PendingCredential>>,
}

impl OtpChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh 6-digit code for `employee_id`, replacing any
    /// previous one.
    pub fn issue(&self, employee_id: &str, bound_name: Option<String>) -> String {
        let code = generate_code();
        self.lock().insert(
            employee_id.to_string(),
            PendingCredential {
                code: code.clone(),
                bound_name,
            },
        );
        tracing::info!(employee_id, "OTP issued");
        code
    }

    /// Replace the code for `employee_id`, keeping its bound name. `None` if
    /// no challenge was ever issued.
    pub fn reissue(&self, employee_id: &str) -> Option<String> {
        let mut pending = self.lock();
        let record = pending.get_mut(employee_id)?;
        record.code = generate_code();
        tracing::info!(employee_id, "OTP reissued");
        Some(record.code.clone())
    }

    /// Exact match against the latest code. On success returns the bound
    /// name (which may itself be absent).
    pub fn verify(&self, employee_id: &str, code: &str) -> Option<Option<String>> {
        let pending = self.lock();
        match pending.get(employee_id) {
            Some(record) if record.code == code.trim() => Some(record.bound_name.clone()),
            _ => {
                tracing::warn!(employee_id, "incorrect OTP entered");
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCredential>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999u32).to_string()
}
