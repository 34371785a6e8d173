//! Span-context propagation across the queue bus, plus structured action
//! logging. The OTLP exporter itself is an external collaborator; workers
//! only parse/format W3C `traceparent` headers and emit `tracing` events
//! that the exporter sidecar picks up.

use rand::RngCore;
use tracing::info;

/// W3C trace context carried in the `traceparent` message header:
/// `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

impl TraceContext {
    /// Fresh root context with random ids, sampled.
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0u8; 16];
        let mut span = [0u8; 8];
        rng.fill_bytes(&mut trace);
        rng.fill_bytes(&mut span);
        Self {
            trace_id: hex::encode(trace),
            span_id: hex::encode(span),
            flags: 1,
        }
    }

    /// Child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        let mut span = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut span);
        Self {
            trace_id: self.trace_id.clone(),
            span_id: hex::encode(span),
            flags: self.flags,
        }
    }

    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !is_lower_hex(trace_id) || !is_lower_hex(span_id) || !is_lower_hex(flags) {
            return None;
        }
        // All-zero trace or span ids are invalid.
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
        })
    }

    pub fn to_header(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Emit a structured action event. The metric extraction hook and OTLP
/// exporter filter on the `quarry::action` target.
pub fn log_action(category: &str, name: &str, task_id: &str, detail: &str) {
    info!(
        target: "quarry::action",
        {
            "action.category" = category,
            "action.name" = name,
            task_id = task_id,
        },
        "{detail}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let ctx = TraceContext::new_root();
        let header = ctx.to_header();
        let parsed = TraceContext::parse(&header).unwrap();
        assert_eq!(parsed, ctx);
    }

    #[test]
    fn child_keeps_trace_id_changes_span() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        assert!(TraceContext::parse("").is_none());
        assert!(TraceContext::parse("00-short-id-01").is_none());
        assert!(TraceContext::parse("01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").is_none());
        // uppercase hex is invalid
        assert!(TraceContext::parse("00-0AF7651916CD43DD8448EB211C80319C-B7AD6B7169203331-01").is_none());
        // all-zero trace id is invalid
        assert!(TraceContext::parse("00-00000000000000000000000000000000-b7ad6b7169203331-01").is_none());
        // trailing segment
        assert!(
            TraceContext::parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra").is_none()
        );
    }

    #[test]
    fn parse_accepts_canonical_header() {
        let ctx = TraceContext::parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();
        assert_eq!(ctx.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.span_id, "b7ad6b7169203331");
        assert_eq!(ctx.flags, 1);
    }
}
