use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One durable progress step shown in the status banner.
///
/// Two steps are the same step when both `message` and `model_tag` match; `received_at` and
/// `kind` do not take part in identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusStep {
    /// Progress text as reported by the backend.
    pub message: String,

    /// Model the backend reported alongside the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tag: Option<String>,

    /// When the step was first received.
    #[serde(with = "crate::utils::time")]
    pub received_at: OffsetDateTime,

    /// How the banner should present this step.
    pub kind: BannerKind,
}

impl StatusStep {
    /// Returns true if this step carries the given `(message, model_tag)` pair.
    pub fn same_step(&self, message: &str, model_tag: Option<&str>) -> bool {
        self.message == message && self.model_tag.as_deref() == model_tag
    }
}

/// Presentation class of a banner step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerKind {
    /// Ordinary progress.
    Info,
    /// The backend retried the request against a stronger or alternate model.
    Escalation,
}

/// The aggregated, deduplicated progress summary for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banner {
    /// Steps in strict arrival order.
    pub steps: Vec<StatusStep>,
}

impl Banner {
    /// Returns true if no steps are shown.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the presentation class of the banner as a whole.
    ///
    /// A banner is an escalation banner as soon as any of its steps is one.
    pub fn kind(&self) -> BannerKind {
        if self
            .steps
            .iter()
            .any(|step| step.kind == BannerKind::Escalation)
        {
            BannerKind::Escalation
        } else {
            BannerKind::Info
        }
    }

    /// Returns the most recent step, if any.
    pub fn latest(&self) -> Option<&StatusStep> {
        self.steps.last()
    }
}
