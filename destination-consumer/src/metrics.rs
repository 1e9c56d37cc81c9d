use metrics::counter;

/// Consumer messages by outcome (consumed, processed, skipped, failed,
/// retryScheduled, deadLettered, notReadyReadded, LOST).
pub const CONSUMER_MESSAGES_COUNTER: &str = "consumer_messages_total";

/// Consumer errors by error code.
pub const CONSUMER_ERRORS_COUNTER: &str = "consumer_errors_total";

/// Batch runs by result (success / fail).
pub const CONSUMER_RUNS_COUNTER: &str = "consumer_runs_total";

/// Recovered panics in long-running loops.
pub const PANICS_COUNTER: &str = "panics_total";

pub fn consumer_messages(
    topic_id: &str,
    mode: &str,
    destination_id: &str,
    table_name: &str,
    status: &str,
    count: u64,
) {
    counter!(
        CONSUMER_MESSAGES_COUNTER,
        "topic" => topic_id.to_string(),
        "mode" => mode.to_string(),
        "destination" => destination_id.to_string(),
        "table" => table_name.to_string(),
        "status" => status.to_string()
    )
    .increment(count);
}

pub fn consumer_errors(
    topic_id: &str,
    mode: &str,
    destination_id: &str,
    table_name: &str,
    error_type: &str,
) {
    counter!(
        CONSUMER_ERRORS_COUNTER,
        "topic" => topic_id.to_string(),
        "mode" => mode.to_string(),
        "destination" => destination_id.to_string(),
        "table" => table_name.to_string(),
        "error" => error_type.to_string()
    )
    .increment(1);
}

pub fn consumer_runs(
    topic_id: &str,
    mode: &str,
    destination_id: &str,
    table_name: &str,
    result: &str,
) {
    counter!(
        CONSUMER_RUNS_COUNTER,
        "topic" => topic_id.to_string(),
        "mode" => mode.to_string(),
        "destination" => destination_id.to_string(),
        "table" => table_name.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn panics() {
    counter!(PANICS_COUNTER).increment(1);
}
