//! Signed permit payloads carried in QR codes.
//!
//! A permit QR proves two things at a checkpoint: that this service minted it (HMAC over
//! `applicationId:timestamp`) and that it was minted recently (24 hour freshness). Whether
//! the visit itself is authorized is decided separately from the application's validity
//! window.

mod render;

pub use render::{PermitImage, PermitRenderer, QrSvgRenderer, RenderError};

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{ApplicationId, PermitRecord};
use super::signature::SignatureService;

/// Maximum age of a QR payload accepted at a checkpoint.
pub const QR_FRESHNESS_HOURS: i64 = 24;

/// Wire format embedded in the QR image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitPayload {
    pub application_id: String,
    pub timestamp: String,
    pub signature: String,
}

/// Lenient mirror of the wire format so missing fields surface as `Malformed`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScannedPayload {
    #[serde(default)]
    application_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedPermit {
    pub payload: PermitPayload,
    /// Serialized payload, usable as a text fallback when the image cannot be shown.
    pub raw: String,
    pub image: PermitImage,
    pub issued_at: DateTime<Utc>,
}

impl IssuedPermit {
    pub fn record(&self) -> PermitRecord {
        PermitRecord {
            payload: self.raw.clone(),
            signature: self.payload.signature.clone(),
            issued_at: self.issued_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermitError {
    #[error("permit payload is malformed: {0}")]
    Malformed(String),
    #[error("permit signature does not match")]
    SignatureInvalid,
    #[error("permit QR has expired (issued {issued_at}, older than 24 hours)")]
    Expired { issued_at: DateTime<Utc> },
    #[error("permit payload could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl PermitError {
    pub fn code(&self) -> &'static str {
        match self {
            PermitError::Malformed(_) => "MALFORMED",
            PermitError::SignatureInvalid => "SIGNATURE_INVALID",
            PermitError::Expired { .. } => "EXPIRED",
            PermitError::Encode(_) | PermitError::Render(_) => "RENDER_FAILURE",
        }
    }
}

/// Builds and verifies signed permit payloads.
#[derive(Clone)]
pub struct PermitCodec {
    signer: SignatureService,
    renderer: Arc<dyn PermitRenderer>,
}

impl PermitCodec {
    pub fn new(signer: SignatureService, renderer: Arc<dyn PermitRenderer>) -> Self {
        Self { signer, renderer }
    }

    pub fn with_qr_renderer(signer: SignatureService) -> Self {
        Self::new(signer, Arc::new(QrSvgRenderer::default()))
    }

    pub fn issue(
        &self,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<IssuedPermit, PermitError> {
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let message = SignatureService::permit_message(application_id.as_str(), &timestamp);
        let payload = PermitPayload {
            application_id: application_id.0.clone(),
            timestamp,
            signature: self.signer.sign(message.as_bytes()),
        };

        let raw = serde_json::to_string(&payload)?;
        let image = self.renderer.render(&raw)?;

        Ok(IssuedPermit {
            payload,
            raw,
            image,
            issued_at: now,
        })
    }

    /// Re-renders the image for a stored permit.
    pub fn render(&self, record: &PermitRecord) -> Result<PermitImage, PermitError> {
        Ok(self.renderer.render(&record.payload)?)
    }

    pub fn parse_and_verify(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<ApplicationId, PermitError> {
        let scanned: ScannedPayload = serde_json::from_str(raw.trim())
            .map_err(|err| PermitError::Malformed(err.to_string()))?;

        let (application_id, timestamp, signature) =
            match (scanned.application_id, scanned.timestamp, scanned.signature) {
                (Some(id), Some(ts), Some(sig))
                    if !id.is_empty() && !ts.is_empty() && !sig.is_empty() =>
                {
                    (id, ts, sig)
                }
                _ => {
                    return Err(PermitError::Malformed(
                        "applicationId, timestamp and signature are required".to_string(),
                    ))
                }
            };

        let message = SignatureService::permit_message(&application_id, &timestamp);
        if !self.signer.verify(message.as_bytes(), &signature) {
            return Err(PermitError::SignatureInvalid);
        }

        let issued_at = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|err| PermitError::Malformed(format!("timestamp: {err}")))?
            .with_timezone(&Utc);

        if now - issued_at > Duration::hours(QR_FRESHNESS_HOURS) {
            return Err(PermitError::Expired { issued_at });
        }

        Ok(ApplicationId(application_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn codec() -> PermitCodec {
        PermitCodec::with_qr_renderer(SignatureService::new(b"codec-test-secret"))
    }

    fn issued_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 8, 30, 0).unwrap()
    }

    #[test]
    fn issued_payload_uses_wire_field_names() {
        let permit = codec()
            .issue(&ApplicationId("app-1".to_string()), issued_at())
            .expect("issues");
        let value: Value = serde_json::from_str(&permit.raw).expect("json");
        assert_eq!(value["applicationId"], "app-1");
        assert_eq!(value["timestamp"], "2026-10-17T08:30:00.000Z");
        let signature = value["signature"].as_str().expect("signature string");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(permit.record().signature, signature);
    }

    #[test]
    fn fresh_permit_verifies() {
        let codec = codec();
        let permit = codec
            .issue(&ApplicationId("app-2".to_string()), issued_at())
            .expect("issues");
        let id = codec
            .parse_and_verify(&permit.raw, issued_at() + Duration::minutes(5))
            .expect("verifies");
        assert_eq!(id, ApplicationId("app-2".to_string()));
    }

    #[test]
    fn freshness_boundary_is_twenty_four_hours() {
        let codec = codec();
        let permit = codec
            .issue(&ApplicationId("app-3".to_string()), issued_at())
            .expect("issues");

        let almost = issued_at() + Duration::hours(23) + Duration::minutes(59);
        assert!(codec.parse_and_verify(&permit.raw, almost).is_ok());

        let exactly = issued_at() + Duration::hours(24);
        assert!(codec.parse_and_verify(&permit.raw, exactly).is_ok());

        let late = issued_at() + Duration::hours(24) + Duration::seconds(1);
        match codec.parse_and_verify(&permit.raw, late) {
            Err(PermitError::Expired { issued_at: at }) => assert_eq!(at, issued_at()),
            other => panic!("expected expiry, got {other:?}"),
        }
    }

    #[test]
    fn tampered_fields_fail_signature() {
        let codec = codec();
        let permit = codec
            .issue(&ApplicationId("app-4".to_string()), issued_at())
            .expect("issues");

        let mut forged = permit.payload.clone();
        forged.application_id = "app-5".to_string();
        let raw = serde_json::to_string(&forged).expect("json");
        let err = codec.parse_and_verify(&raw, issued_at()).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");

        let mut restamped = permit.payload.clone();
        restamped.timestamp = "2026-10-18T08:30:00.000Z".to_string();
        let raw = serde_json::to_string(&restamped).expect("json");
        assert!(matches!(
            codec.parse_and_verify(&raw, issued_at()),
            Err(PermitError::SignatureInvalid)
        ));
    }

    #[test]
    fn signature_check_runs_before_expiry() {
        let codec = codec();
        let permit = codec
            .issue(&ApplicationId("app-6".to_string()), issued_at())
            .expect("issues");
        let mut forged = permit.payload;
        forged.signature = "0".repeat(64);
        let raw = serde_json::to_string(&forged).expect("json");
        let err = codec
            .parse_and_verify(&raw, issued_at() + Duration::days(3))
            .unwrap_err();
        assert!(matches!(err, PermitError::SignatureInvalid));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let codec = codec();
        for raw in [
            "not json",
            "{}",
            r#"{"applicationId":"a","timestamp":"t"}"#,
            r#"{"applicationId":"","timestamp":"t","signature":"s"}"#,
            r#"{"applicationId":7,"timestamp":"t","signature":"s"}"#,
        ] {
            let err = codec.parse_and_verify(raw, issued_at()).unwrap_err();
            assert_eq!(err.code(), "MALFORMED", "payload {raw}");
        }
    }

    #[test]
    fn foreign_key_cannot_mint_permits() {
        let other = PermitCodec::with_qr_renderer(SignatureService::new(b"someone-else"));
        let permit = other
            .issue(&ApplicationId("app-7".to_string()), issued_at())
            .expect("issues");
        assert!(matches!(
            codec().parse_and_verify(&permit.raw, issued_at()),
            Err(PermitError::SignatureInvalid)
        ));
    }
}
