// Kept in sync by hand with the `initialize()` DDL in each mapper.

diesel::table! {
    ingest_operations (ingest_id) {
        ingest_id -> BigInt,
        name -> Text,
        created -> Text,
        fs_path -> Text,
        config -> Text,
        stage -> Text,
        version -> Text,
        processing_start -> Nullable<Text>,
        processing_end -> Nullable<Text>,
    }
}

diesel::table! {
    ingest_items (item_id) {
        item_id -> BigInt,
        ingest_id -> BigInt,
        subdir -> Text,
        files -> Text,
        size -> BigInt,
        item_type -> Text,
        context -> Text,
        discover_task_id -> Nullable<BigInt>,
        scan_task_id -> Nullable<BigInt>,
    }
}

diesel::table! {
    discover_queue (task_id) {
        task_id -> BigInt,
        ingest_id -> BigInt,
        actor_id -> Nullable<Text>,
        status -> Text,
        claimed_at -> Nullable<Text>,
    }
}

diesel::table! {
    scan_queue (task_id) {
        task_id -> BigInt,
        ingest_id -> BigInt,
        path -> Text,
        context -> Text,
        scanner_type -> Text,
        actor_id -> Nullable<Text>,
        status -> Text,
        claimed_at -> Nullable<Text>,
        discover_task_id -> Nullable<BigInt>,
    }
}

diesel::table! {
    work_queue (task_id) {
        task_id -> BigInt,
        item_id -> BigInt,
        ingest_id -> BigInt,
        context -> Text,
        actor_id -> Nullable<Text>,
        status -> Text,
        claimed_at -> Nullable<Text>,
    }
}

diesel::table! {
    audit_logs (log_id) {
        log_id -> BigInt,
        ingest_id -> BigInt,
        src_path -> Text,
        fw_path -> Nullable<Text>,
        failed -> Bool,
        message -> Nullable<Text>,
    }
}

diesel::table! {
    deid_logs (log_id) {
        log_id -> BigInt,
        ingest_id -> BigInt,
        path -> Text,
        log_type -> Text,
        field_values -> Text,
        created -> Text,
    }
}

diesel::table! {
    subjects_mapping (map_id) {
        map_id -> BigInt,
        ingest_id -> BigInt,
        subject_id -> BigInt,
        subject_code -> Text,
        field_values -> Text,
    }
}

diesel::table! {
    private_tags (tag_id) {
        tag_id -> BigInt,
        ingest_id -> BigInt,
        private_creator -> Text,
        tag -> Text,
        vr -> Text,
        description -> Text,
        vm -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    ingest_operations,
    ingest_items,
    discover_queue,
    scan_queue,
    work_queue,
    audit_logs,
    deid_logs,
    subjects_mapping,
    private_tags,
);
