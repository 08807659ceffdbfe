use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogVariant {
    Danger,
    Success,
    Info,
}

/// A blocking accept/cancel question put to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub title: String,
    pub message: String,
    pub variant: DialogVariant,
    pub confirm_label: String,
}

impl ConfirmationRequest {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        variant: DialogVariant,
        confirm_label: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            variant,
            confirm_label: confirm_label.into(),
        }
    }
}

/// Whoever answers confirmation requests: a dialog, an HTTP flag, a CLI flag.
/// `false` means dismissed.
#[async_trait::async_trait]
pub trait Confirmer: Send + Sync {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> bool;
}

/// Answers every request with a decision made up front.
#[derive(Debug, Clone, Copy)]
pub struct PreConfirmed(pub bool);

#[async_trait::async_trait]
impl Confirmer for PreConfirmed {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> bool {
        tracing::debug!(title = %request.title, accepted = self.0, "confirmation answered up front");
        self.0
    }
}
