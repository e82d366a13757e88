use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};
use serde::Serialize;

/// Turns a permit payload into a scannable image. Implementations must be pure.
pub trait PermitRenderer: Send + Sync {
    fn render(&self, payload: &str) -> Result<PermitImage, RenderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermitImage {
    pub content_type: &'static str,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl PermitImage {
    /// `data:` URL suitable for embedding in e-mails or dashboards.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.content_type, STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("payload cannot be encoded as a QR symbol: {0}")]
    Encode(String),
}

/// SVG QR renderer at the highest error-correction level.
#[derive(Debug, Clone, Copy)]
pub struct QrSvgRenderer {
    min_dimension: u32,
}

impl QrSvgRenderer {
    pub fn new(min_dimension: u32) -> Self {
        Self { min_dimension }
    }
}

impl Default for QrSvgRenderer {
    fn default() -> Self {
        Self::new(300)
    }
}

impl PermitRenderer for QrSvgRenderer {
    fn render(&self, payload: &str) -> Result<PermitImage, RenderError> {
        let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)
            .map_err(|err| RenderError::Encode(err.to_string()))?;
        let image = code
            .render::<svg::Color<'_>>()
            .min_dimensions(self.min_dimension, self.min_dimension)
            .quiet_zone(true)
            .build();

        Ok(PermitImage {
            content_type: "image/svg+xml",
            bytes: image.into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_svg_document() {
        let image = QrSvgRenderer::default()
            .render(r#"{"applicationId":"a","timestamp":"t","signature":"s"}"#)
            .expect("renders");
        assert_eq!(image.content_type, "image/svg+xml");
        let text = String::from_utf8(image.bytes.clone()).expect("utf8 svg");
        assert!(text.contains("<svg"));
        assert!(image.data_url().starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn oversized_payload_fails() {
        let payload = "x".repeat(5_000);
        assert!(matches!(
            QrSvgRenderer::default().render(&payload),
            Err(RenderError::Encode(_))
        ));
    }
}
