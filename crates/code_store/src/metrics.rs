use metrics::{
    log_counter,
    register_srk_counter,
};

register_srk_counter!(
    CODE_STORE_BLOBS_SAVED_TOTAL,
    "Number of distinct code archives inserted into the store"
);
register_srk_counter!(
    CODE_STORE_BYTES_SAVED_TOTAL,
    "Total archive bytes inserted into the store"
);
register_srk_counter!(
    CODE_STORE_BLOBS_SERVED_TOTAL,
    "Number of archives served over the code endpoint"
);

pub fn log_code_blob_saved(len: usize) {
    log_counter(&CODE_STORE_BLOBS_SAVED_TOTAL, 1);
    log_counter(&CODE_STORE_BYTES_SAVED_TOTAL, len as u64);
}

pub fn log_code_blob_served() {
    log_counter(&CODE_STORE_BLOBS_SERVED_TOTAL, 1);
}
