use quarry_core::bus::MessageHeaders;

/// The retry policy is a state machine on the message header: a failure at
/// x-retry = N-1 republishes at N, and x-retry >= limit is dropped.
#[test]
fn failed_message_republishes_with_incremented_retry() {
    let limit = 3u32;
    let mut headers = MessageHeaders::default();
    assert_eq!(headers.retry, 0);

    let mut republished = 0;
    while headers.retry < limit {
        headers = headers.incremented();
        republished += 1;
    }
    assert_eq!(republished, 3);
    assert_eq!(headers.retry, 3);
    // The consumer gate drops anything at or over the limit.
    assert!(headers.retry >= limit);
}

#[test]
fn incrementing_preserves_trace_context() {
    let ctx = quarry_core::telemetry::TraceContext::new_root();
    let headers = MessageHeaders::with_trace(&ctx);
    let next = headers.incremented();
    assert_eq!(next.traceparent, headers.traceparent);
    assert_eq!(next.trace_context().unwrap().trace_id, ctx.trace_id);
}

#[test]
fn headers_survive_the_broker_encoding() {
    let ctx = quarry_core::telemetry::TraceContext::new_root();
    let mut headers = MessageHeaders::with_trace(&ctx);
    headers.extra.insert("slice_result".into(), "/no_results".into());
    let headers = headers.incremented().incremented();

    let table = headers.to_field_table();
    let decoded = MessageHeaders::from_field_table(Some(&table));
    assert_eq!(decoded.retry, 2);
    assert_eq!(decoded.trace_context().unwrap().trace_id, ctx.trace_id);
    assert_eq!(decoded.extra.get("slice_result").map(String::as_str), Some("/no_results"));
}
