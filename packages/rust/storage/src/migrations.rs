//! SQL migration definitions for the tastebase database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: chefs, restaurants, shows, chef_shows",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS chefs (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    bio             TEXT,
    city            TEXT,
    state           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chefs_normalized ON chefs(normalized_name);

CREATE TABLE IF NOT EXISTS restaurants (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    normalized_name   TEXT NOT NULL,
    chef_id           TEXT REFERENCES chefs(id) ON DELETE SET NULL,
    city              TEXT,
    state             TEXT,
    address           TEXT,
    status            TEXT NOT NULL DEFAULT 'unknown',
    status_checked_at TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_restaurants_normalized ON restaurants(normalized_name);
CREATE INDEX IF NOT EXISTS idx_restaurants_chef ON restaurants(chef_id);
CREATE INDEX IF NOT EXISTS idx_restaurants_status ON restaurants(status);

CREATE TABLE IF NOT EXISTS shows (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    normalized_name TEXT NOT NULL UNIQUE,
    network         TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chef_shows (
    id         TEXT PRIMARY KEY,
    chef_id    TEXT NOT NULL REFERENCES chefs(id) ON DELETE CASCADE,
    show_id    TEXT NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
    role       TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(chef_id, show_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Discoveries, search cache, audit log, review queue",
            sql: r#"
CREATE TABLE IF NOT EXISTS pending_discoveries (
    id             TEXT PRIMARY KEY,
    discovery_type TEXT NOT NULL,
    identity_key   TEXT NOT NULL,
    source_ref     TEXT NOT NULL,
    payload_json   TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

-- At most one live discovery per identity
CREATE UNIQUE INDEX IF NOT EXISTS idx_discoveries_live_identity
    ON pending_discoveries(discovery_type, identity_key)
    WHERE status IN ('pending', 'approved', 'needs_review');

CREATE INDEX IF NOT EXISTS idx_discoveries_status ON pending_discoveries(status);

-- Append-only external call cache; reads take the newest unexpired row
CREATE TABLE IF NOT EXISTS search_cache (
    id           TEXT PRIMARY KEY,
    query_hash   TEXT NOT NULL,
    entity_type  TEXT NOT NULL,
    entity_id    TEXT,
    entity_name  TEXT,
    query        TEXT NOT NULL,
    results_json TEXT NOT NULL,
    fetched_at   TEXT NOT NULL,
    expires_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_search_cache_hash ON search_cache(query_hash, expires_at);
CREATE INDEX IF NOT EXISTS idx_search_cache_entity ON search_cache(entity_type, entity_id);

CREATE TABLE IF NOT EXISTS audit_log (
    id          TEXT PRIMARY KEY,
    table_name  TEXT NOT NULL,
    record_id   TEXT,
    change_type TEXT NOT NULL,
    old_data    TEXT,
    new_data    TEXT,
    source      TEXT NOT NULL,
    confidence  REAL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_table_record ON audit_log(table_name, record_id);

CREATE TABLE IF NOT EXISTS review_queue (
    id          TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    record_a    TEXT NOT NULL,
    record_b    TEXT NOT NULL,
    confidence  REAL NOT NULL,
    reasoning   TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'open',
    created_at  TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
