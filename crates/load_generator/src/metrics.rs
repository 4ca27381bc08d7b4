use metrics::{
    log_counter,
    register_srk_counter,
};

register_srk_counter!(SCAN_LAUNCHES_TOTAL, "Invocations launched by the scan driver");
register_srk_counter!(
    SCAN_LAUNCH_FAILURES_TOTAL,
    "Invocation launches that failed and were not retried"
);

pub fn log_launched() {
    log_counter(&SCAN_LAUNCHES_TOTAL, 1);
}

pub fn log_launch_failed() {
    log_counter(&SCAN_LAUNCH_FAILURES_TOTAL, 1);
}
