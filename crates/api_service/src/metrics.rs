use metrics::{
    log_counter,
    register_srk_counter,
    register_srk_histogram,
    Timer,
};
use runtime_broker::InvocationType;

register_srk_counter!(API_FUNCTIONS_INSTALLED_TOTAL, "Functions installed");
register_srk_counter!(API_FUNCTIONS_REMOVED_TOTAL, "Functions removed");
register_srk_counter!(
    API_SYNC_INVOCATIONS_TOTAL,
    "RequestResponse invocations received"
);
register_srk_counter!(API_EVENT_INVOCATIONS_TOTAL, "Event invocations received");
register_srk_counter!(API_DRY_RUN_INVOCATIONS_TOTAL, "DryRun invocations received");
register_srk_histogram!(
    API_SYNC_INVOKE_SECONDS,
    "Time a synchronous invocation spent waiting for its reply"
);

pub fn log_function_installed() {
    log_counter(&API_FUNCTIONS_INSTALLED_TOTAL, 1);
}

pub fn log_function_removed() {
    log_counter(&API_FUNCTIONS_REMOVED_TOTAL, 1);
}

pub fn log_invocation(invocation_type: InvocationType) {
    let counter = match invocation_type {
        InvocationType::RequestResponse => &API_SYNC_INVOCATIONS_TOTAL,
        InvocationType::Event => &API_EVENT_INVOCATIONS_TOTAL,
        InvocationType::DryRun => &API_DRY_RUN_INVOCATIONS_TOTAL,
    };
    log_counter(counter, 1);
}

pub fn sync_invoke_timer() -> Timer {
    Timer::new(&API_SYNC_INVOKE_SECONDS)
}
