diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Text,
        max_concurrent_bots -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    meetings (id) {
        id -> Uuid,
        user_id -> Uuid,
        platform -> Varchar,
        native_meeting_id -> Varchar,
        meeting_url -> Nullable<Text>,
        status -> Varchar,
        session_uid -> Varchar,
        bot_container_id -> Nullable<Varchar>,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
        config -> Jsonb,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    meeting_sessions (id) {
        id -> Uuid,
        meeting_id -> Uuid,
        session_uid -> Varchar,
        session_start_time -> Timestamptz,
    }
}

diesel::joinable!(meetings -> users (user_id));
diesel::joinable!(meeting_sessions -> meetings (meeting_id));

diesel::allow_tables_to_appear_in_same_query!(users, meetings, meeting_sessions);
