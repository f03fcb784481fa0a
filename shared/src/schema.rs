diesel::table! {
    establishments (id) {
        id -> Uuid,
        name -> Varchar,
        slug -> Varchar,
        phone -> Nullable<Varchar>,
        active -> Bool,
        subscription_status -> Varchar,
        subscription_expires_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    saas_plans (id) {
        id -> Uuid,
        name -> Varchar,
        price -> Numeric,
        interval_days -> Int4,
        iugu_plan_identifier -> Nullable<Varchar>,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    subscriptions (id) {
        id -> Uuid,
        establishment_id -> Uuid,
        plan_id -> Nullable<Uuid>,
        status -> Varchar,
        gateway -> Nullable<Varchar>,
        external_id -> Nullable<Varchar>,
        external_customer_id -> Nullable<Varchar>,
        expires_at -> Nullable<Timestamptz>,
        retry_count -> Int4,
        last_payment_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    saas_payments (id) {
        id -> Uuid,
        subscription_id -> Uuid,
        establishment_id -> Uuid,
        gateway -> Varchar,
        external_payment_id -> Varchar,
        amount -> Numeric,
        status -> Varchar,
        failure_reason -> Nullable<Text>,
        paid_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    usuarios (id) {
        id -> Uuid,
        establishment_id -> Nullable<Uuid>,
        name -> Varchar,
        email -> Varchar,
        phone -> Nullable<Varchar>,
        role -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    barbeiros (id) {
        id -> Uuid,
        establishment_id -> Uuid,
        user_id -> Nullable<Uuid>,
        name -> Varchar,
        phone -> Nullable<Varchar>,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    agendamentos (id) {
        id -> Uuid,
        establishment_id -> Uuid,
        barber_id -> Uuid,
        client_name -> Varchar,
        client_phone -> Varchar,
        service -> Varchar,
        price -> Nullable<Numeric>,
        starts_at -> Timestamptz,
        ends_at -> Timestamptz,
        status -> Varchar,
        reminder_sent -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    whatsapp_config (establishment_id) {
        establishment_id -> Uuid,
        enabled -> Bool,
        api_url -> Varchar,
        instance -> Varchar,
        api_token -> Varchar,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    whatsapp_logs (id) {
        id -> Uuid,
        establishment_id -> Uuid,
        appointment_id -> Nullable<Uuid>,
        phone -> Varchar,
        message -> Text,
        status -> Varchar,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_webhooks (gateway, event_key) {
        gateway -> Varchar,
        event_key -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    processed_events (event_id) {
        event_id -> Uuid,
        event_type -> Varchar,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(subscriptions -> establishments (establishment_id));
diesel::joinable!(subscriptions -> saas_plans (plan_id));
diesel::joinable!(usuarios -> establishments (establishment_id));
diesel::joinable!(barbeiros -> establishments (establishment_id));
diesel::joinable!(agendamentos -> establishments (establishment_id));
diesel::joinable!(agendamentos -> barbeiros (barber_id));
diesel::joinable!(whatsapp_config -> establishments (establishment_id));

diesel::allow_tables_to_appear_in_same_query!(
    establishments,
    saas_plans,
    subscriptions,
    saas_payments,
    usuarios,
    barbeiros,
    agendamentos,
    whatsapp_config,
    whatsapp_logs,
    outbox_events,
    processed_webhooks,
    processed_events,
);
