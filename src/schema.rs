// Ramify schema - conversation tree tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    conversations (id) {
        id -> Text,
        title -> Text,
        root_node_id -> Nullable<Text>,
        current_node_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    nodes (seq) {
        seq -> Integer,               // Insertion order, gives children order
        id -> Text,                   // Client-assigned UUID
        conversation_id -> Text,
        parent_id -> Nullable<Text>,
        hierarchical_id -> Text,      // "1", "1.a", "1.a.1"
        is_branch -> Bool,
        title -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> Integer,
        node_id -> Text,
        role -> Text,                 // 'user' | 'model'
        content -> Text,
        ordinal -> Integer,           // Unique per node
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(conversations, nodes, messages, schema_versions,);
