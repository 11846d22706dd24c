use redb::TableDefinition;

/// Accounts: username -> UserRecord (msgpack)
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Sessions: cookie value -> SessionRecord (msgpack)
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Share links: code -> LinkRecord (msgpack)
pub const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");
