// TimeFiles schema - timing engine tables for Diesel ORM

diesel::table! {
    meta (id) {
        id -> Integer,
        schema_version -> BigInt,
    }
}

diesel::table! {
    tasks (id) {
        id -> Text,
        parent_id -> Nullable<Text>,
        title -> Text,
        status -> Text,
        created_at -> BigInt,
        archived_at -> Nullable<BigInt>,
    }
}

diesel::table! {
    tags (id) {
        id -> Text,
        name -> Text,
        created_at -> BigInt,
    }
}

diesel::table! {
    task_tags (task_id, tag_id) {
        task_id -> Text,
        tag_id -> Text,
        created_at -> BigInt,
    }
}

diesel::table! {
    time_events (sequence) {
        sequence -> BigInt,
        task_id -> Text,
        kind -> Text,
        at -> BigInt,
        payload -> Nullable<Text>,
    }
}

diesel::table! {
    rest_suggestions (id) {
        id -> BigInt,
        trigger_type -> Text,
        task_id -> Nullable<Text>,
        focus_seconds -> BigInt,
        switch_count_30m -> BigInt,
        deviation_ratio -> Double,
        suggested_minutes -> BigInt,
        reasons -> Text,
        status -> Text,
        created_at -> BigInt,
        responded_at -> Nullable<BigInt>,
    }
}
