use std::env;
use std::sync::OnceLock;

static TRACE_TRANSFERS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn trace_transfers_enabled() -> bool {
    *TRACE_TRANSFERS.get_or_init(|| match env::var("SYNCVEC_TRACE_TRANSFERS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
