use metrics::{
    log_counter,
    register_srk_counter,
};

register_srk_counter!(
    WORKER_INSTANCES_STARTED_TOTAL,
    "Container instances launched by this worker"
);
register_srk_counter!(
    WORKER_INSTANCES_STOPPED_TOTAL,
    "Container instances stopped by reconciliation or shutdown"
);
register_srk_counter!(
    WORKER_INSTANCES_EXITED_TOTAL,
    "Container instances that exited without being asked to"
);
register_srk_counter!(
    WORKER_CODE_FETCHES_TOTAL,
    "Code archives fetched from the code endpoint"
);
register_srk_counter!(
    WORKER_CODE_FETCH_BYTES_TOTAL,
    "Total archive bytes fetched from the code endpoint"
);

pub fn log_instance_started() {
    log_counter(&WORKER_INSTANCES_STARTED_TOTAL, 1);
}

pub fn log_instances_stopped(count: usize) {
    log_counter(&WORKER_INSTANCES_STOPPED_TOTAL, count as u64);
}

pub fn log_instance_exited() {
    log_counter(&WORKER_INSTANCES_EXITED_TOTAL, 1);
}

pub fn log_code_fetched(len: usize) {
    log_counter(&WORKER_CODE_FETCHES_TOTAL, 1);
    log_counter(&WORKER_CODE_FETCH_BYTES_TOTAL, len as u64);
}
