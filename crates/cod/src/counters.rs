//! Process-wide monotonic counters, recorded through the `metrics` facade.
//! Call sites are cheap no-ops unless the embedding process installs a
//! recorder.

use crate::store::StorageClass;

pub(crate) fn duplicate_series() {
    metrics::counter!("cod_append_duplicate_series_total").increment(1);
}

pub(crate) fn true_dupe() {
    metrics::counter!("cod_append_true_duplicates_total").increment(1);
}

pub(crate) fn diff_hash_dupe() {
    metrics::counter!("cod_append_diff_hash_duplicates_total").increment(1);
}

pub(crate) fn tar_success(bytes: u64) {
    metrics::counter!("cod_append_tar_success_total").increment(1);
    metrics::counter!("cod_append_tar_bytes_processed_total").increment(bytes);
}

pub(crate) fn storage_get(class: StorageClass) {
    metrics::counter!("cod_storage_gets_total", "class" => class.as_str()).increment(1);
}

pub(crate) fn storage_create(class: StorageClass) {
    metrics::counter!("cod_storage_creates_total", "class" => class.as_str()).increment(1);
}

pub(crate) fn dependency_deleted() {
    metrics::counter!("cod_deletion_deletes_total").increment(1);
}

pub(crate) fn dependency_missing() {
    metrics::counter!("cod_deletion_dependency_missing_total").increment(1);
}

pub(crate) fn dependency_hash_mismatch() {
    metrics::counter!("cod_deletion_crc32c_mismatch_total").increment(1);
}

pub(crate) fn dependency_nested() {
    metrics::counter!("cod_deletion_nested_dependency_total").increment(1);
}
