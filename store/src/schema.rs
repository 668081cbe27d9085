diesel::table! {
    customers (id) {
        id -> Int8,
        name -> Varchar,
        email -> Varchar,
        address -> Varchar,
    }
}

diesel::table! {
    products (id) {
        id -> Int8,
        name -> Varchar,
        sku -> Varchar,
        price -> Numeric,
        stock -> Int4,
        version -> Int8,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        customer_id -> Int8,
        order_date -> Timestamptz,
        status -> Varchar,
    }
}

diesel::table! {
    order_lines (id) {
        id -> Int8,
        order_id -> Int8,
        position -> Int4,
        product_id -> Int8,
        quantity -> Int4,
        price -> Numeric,
    }
}

diesel::table! {
    shipments (id) {
        id -> Int8,
        order_id -> Int8,
        dispatched_at -> Timestamptz,
        delivered_at -> Nullable<Timestamptz>,
        status -> Varchar,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Int8,
        topic -> Varchar,
        partition_key -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(orders -> customers (customer_id));
diesel::joinable!(order_lines -> orders (order_id));
diesel::joinable!(order_lines -> products (product_id));
diesel::joinable!(shipments -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    customers,
    products,
    orders,
    order_lines,
    shipments,
    outbox_events,
);
