use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::fs::File;
use tracing::{error, warn};

use crate::security::audit::{AuditAction, AuditEvent, AuditLog};
use crate::security::throttle::AttemptThrottle;
use crate::store::FileStore;

/// Verified against when no record matches the requested id, so a miss costs
/// the same as a password mismatch. Not the hash of any known password.
const DUMMY_VERIFIER: &str = "$2b$12$hgLOvaVXIsfrsL8R2jDl8eZW5nCZAXDXWodMlGCVx1wGMDTY0q2eu";

/// Why a download request was refused. The HTTP layer maps each variant to a
/// status and message; `InvalidCredentials` covers nonexistent files, wrong
/// passwords, and missing blobs alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// Malformed id or missing password. Never throttled, never audited.
    BadRequest(&'static str),
    /// The (client, file) key is currently blocked.
    TooManyAttempts { retry_secs: u64 },
    /// Generic authentication failure.
    InvalidCredentials { just_blocked: bool },
    /// Authenticated, but the file is administratively disabled.
    Disabled,
    /// Authenticated, but the download quota is exhausted.
    LimitReached,
    /// Infrastructure failure.
    Internal,
}

pub const MSG_INVALID_REQUEST: &str = "Invalid request";
pub const MSG_PASSWORD_REQUIRED: &str = "Password is required";

/// A granted download: the open blob handle plus the response metadata.
#[derive(Debug)]
pub struct DownloadGrant {
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub file: File,
}

/// Canonical lowercase hyphenated UUID (8-4-4-4-12 hex groups).
pub fn is_canonical_file_id(id: &str) -> bool {
    static FILE_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = FILE_ID_RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    });
    re.is_match(id)
}

/// Authorization state machine run once per download request: throttle check,
/// credential verification, business rules, audit trail, and only then the
/// blob handle.
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    store: Arc<FileStore>,
    throttle: AttemptThrottle,
    audit: AuditLog,
    upload_dir: PathBuf,
}

impl Gatekeeper {
    pub fn new(
        store: Arc<FileStore>,
        throttle: AttemptThrottle,
        audit: AuditLog,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            throttle,
            audit,
            upload_dir,
        }
    }

    pub fn throttle(&self) -> &AttemptThrottle {
        &self.throttle
    }

    pub async fn authorize(
        &self,
        file_id: &str,
        password: Option<&str>,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Result<DownloadGrant, Denial> {
        // Shape check before any lookup. A malformed id is not a credential
        // failure and leaves no trace.
        if !is_canonical_file_id(file_id) {
            return Err(Denial::BadRequest(MSG_INVALID_REQUEST));
        }

        let check = self.throttle.check(ip, file_id).await;
        if check.limited {
            let retry_secs = check.remaining_secs.unwrap_or(0);
            self.audit
                .record(self.event(
                    ip,
                    file_id,
                    None,
                    AuditAction::Blocked,
                    Some(format!("Rate limited ({retry_secs}s remaining)")),
                    user_agent,
                ))
                .await;
            return Err(Denial::TooManyAttempts { retry_secs });
        }

        // No credential offered means no credential failure occurred.
        let Some(password) = password else {
            return Err(Denial::BadRequest(MSG_PASSWORD_REQUIRED));
        };

        let record = match self.store.get(file_id) {
            Ok(record) => record,
            Err(e) => {
                error!("file lookup failed: {e:#}");
                return Err(Denial::Internal);
            }
        };

        let stored_hash = record
            .as_ref()
            .map(|r| r.password_hash.clone())
            .unwrap_or_else(|| DUMMY_VERIFIER.to_string());
        let supplied = password.to_string();
        let password_valid =
            match tokio::task::spawn_blocking(move || bcrypt::verify(supplied, &stored_hash)).await
            {
                Ok(Ok(valid)) => valid,
                Ok(Err(e)) => {
                    error!("password verification error: {e}");
                    false
                }
                Err(e) => {
                    error!("password verification task failed: {e}");
                    false
                }
            };

        // Nonexistent file and wrong password converge here, deliberately
        // indistinguishable to the caller.
        let Some(record) = record.filter(|_| password_valid) else {
            return Err(self.generic_failure(ip, file_id, user_agent).await);
        };

        if !record.is_enabled {
            self.audit
                .record(self.event(
                    ip,
                    file_id,
                    Some(record.original_name.clone()),
                    AuditAction::Blocked,
                    Some("File is disabled".to_string()),
                    user_agent,
                ))
                .await;
            return Err(Denial::Disabled);
        }

        if let Some(limit) = record.download_limit {
            if record.download_count >= limit {
                self.audit
                    .record(self.event(
                        ip,
                        file_id,
                        Some(record.original_name.clone()),
                        AuditAction::Blocked,
                        Some(format!(
                            "Download limit reached ({}/{})",
                            record.download_count, limit
                        )),
                        user_agent,
                    ))
                    .await;
                return Err(Denial::LimitReached);
            }
        }

        let blob_path = self.upload_dir.join(&record.stored_name);
        let file = match File::open(&blob_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Missing bytes must not be distinguishable from a bad password
                warn!(
                    "stored blob missing for file {}: {}",
                    record.id,
                    blob_path.display()
                );
                return Err(self.generic_failure(ip, file_id, user_agent).await);
            }
            Err(e) => {
                error!("failed to open stored blob {}: {}", blob_path.display(), e);
                return Err(Denial::Internal);
            }
        };

        self.throttle.clear(ip, file_id).await;
        self.audit
            .record(self.event(
                ip,
                file_id,
                Some(record.original_name.clone()),
                AuditAction::Success,
                None,
                user_agent,
            ))
            .await;

        // The increment is part of the success path; once it lands, the grant
        // stands whether or not the client finishes the stream.
        if let Err(e) = self.store.increment_download_count(&record.id) {
            error!("failed to increment download count: {e:#}");
            return Err(Denial::Internal);
        }

        Ok(DownloadGrant {
            file_name: record.original_name,
            file_size: record.file_size,
            mime_type: record.mime_type,
            file,
        })
    }

    async fn generic_failure(&self, ip: &str, file_id: &str, user_agent: Option<&str>) -> Denial {
        let verdict = self.throttle.record_failure(ip, file_id).await;
        let reason = if verdict.blocked {
            "Invalid credentials - IP now blocked".to_string()
        } else {
            format!(
                "Invalid credentials ({} attempts remaining)",
                verdict.remaining_attempts.unwrap_or(0)
            )
        };
        self.audit
            .record(self.event(
                ip,
                file_id,
                None,
                AuditAction::Failed,
                Some(reason),
                user_agent,
            ))
            .await;
        Denial::InvalidCredentials {
            just_blocked: verdict.blocked,
        }
    }

    fn event(
        &self,
        ip: &str,
        file_id: &str,
        file_name: Option<String>,
        action: AuditAction,
        reason: Option<String>,
        user_agent: Option<&str>,
    ) -> AuditEvent {
        AuditEvent {
            ip: ip.to_string(),
            file_id: file_id.to_string(),
            file_name,
            action,
            reason,
            user_agent: user_agent.map(str::to_string),
        }
    }
}
