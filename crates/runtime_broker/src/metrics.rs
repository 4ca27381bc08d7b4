use metrics::{
    log_counter,
    register_srk_counter,
};

register_srk_counter!(
    BROKER_ENQUEUED_TOTAL,
    "Invocations pushed onto a broker work queue"
);
register_srk_counter!(
    BROKER_QUEUE_FULL_TOTAL,
    "Enqueues rejected because the work queue was at capacity"
);
register_srk_counter!(
    BROKER_EXPIRED_IN_QUEUE_TOTAL,
    "Queued invocations discarded because their caller had already given up"
);
register_srk_counter!(
    BROKER_COMPLETED_TOTAL,
    "Invocations completed with a payload response"
);
register_srk_counter!(
    BROKER_FUNCTION_ERRORS_TOTAL,
    "Invocations completed with a function-reported error"
);
register_srk_counter!(
    BROKER_TIMEOUTS_TOTAL,
    "Invocations whose deadline elapsed before a container responded"
);
register_srk_counter!(
    BROKER_INIT_ERRORS_TOTAL,
    "Fatal init errors reported by container instances"
);

pub fn log_enqueued() {
    log_counter(&BROKER_ENQUEUED_TOTAL, 1);
}

pub fn log_queue_full() {
    log_counter(&BROKER_QUEUE_FULL_TOTAL, 1);
}

pub fn log_expired_in_queue() {
    log_counter(&BROKER_EXPIRED_IN_QUEUE_TOTAL, 1);
}

pub fn log_completed() {
    log_counter(&BROKER_COMPLETED_TOTAL, 1);
}

pub fn log_function_error() {
    log_counter(&BROKER_FUNCTION_ERRORS_TOTAL, 1);
}

pub fn log_timeout() {
    log_counter(&BROKER_TIMEOUTS_TOTAL, 1);
}

pub fn log_init_error() {
    log_counter(&BROKER_INIT_ERRORS_TOTAL, 1);
}
