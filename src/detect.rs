use crate::headers::Headers;

/// Signature headers surfaced for senders we do not recognise, in priority order.
const FALLBACK_SIGNATURE_HEADERS: &[&str] = &[
    "X-Hub-Signature-256",
    "X-Hub-Signature",
    "X-Slack-Signature",
    "X-Shopify-Hmac-SHA256",
    "X-Twilio-Signature",
];

pub const UNKNOWN_PROVIDER: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub provider: String,
    pub event_type: String,
    pub signature: String,
}

/// Guess which service sent a webhook. Never fails: unrecognised senders come back as
/// `unknown`, with whatever signature header they carried.
pub fn detect(headers: &Headers, body: &[u8]) -> Detection {
    let stripe_sig = headers.value("Stripe-Signature");
    if !stripe_sig.trim().is_empty() {
        return Detection {
            provider: "stripe".into(),
            event_type: json_string_field(body, "type"),
            signature: stripe_sig.to_string(),
        };
    }

    let github_event = headers.value("X-GitHub-Event");
    if !github_event.trim().is_empty() {
        return Detection {
            provider: "github".into(),
            event_type: github_event.to_string(),
            signature: headers.value("X-Hub-Signature-256").to_string(),
        };
    }

    let signature = FALLBACK_SIGNATURE_HEADERS
        .iter()
        .map(|name| headers.value(name))
        .find(|v| !v.trim().is_empty())
        .unwrap_or("");

    Detection {
        provider: UNKNOWN_PROVIDER.into(),
        event_type: String::new(),
        signature: signature.to_string(),
    }
}

fn json_string_field(body: &[u8], key: &str) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get(key)?.as_str().map(str::to_string))
        .unwrap_or_default()
}
