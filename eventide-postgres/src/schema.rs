//! Table definitions, applied in order by [`crate::migrate`].

pub(crate) const MIGRATION_LOCK_ID: i64 = 0x6576_656e_7469_6465;

pub(crate) const STATEMENTS: [&str; 8] = [
    r"
    CREATE TABLE IF NOT EXISTS eventide_events (
        event_id       UUID        PRIMARY KEY,
        partition_key  TEXT        NOT NULL,
        aggregate_id   TEXT        NOT NULL,
        version        BIGINT      NOT NULL CHECK (version > 0),
        event_type     TEXT        NOT NULL,
        payload        JSONB       NOT NULL,
        metadata       JSONB       NOT NULL,
        recorded_at    TIMESTAMPTZ NOT NULL,
        CONSTRAINT eventide_events_stream_version UNIQUE (partition_key, aggregate_id, version)
    )",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS eventide_events_recorded_at
        ON eventide_events (recorded_at)",
    r"
    CREATE TABLE IF NOT EXISTS eventide_clock (
        id             SMALLINT    PRIMARY KEY CHECK (id = 1),
        last_timestamp TIMESTAMPTZ NOT NULL
    )",
    r"
    INSERT INTO eventide_clock (id, last_timestamp)
    VALUES (1, 'epoch')
    ON CONFLICT (id) DO NOTHING",
    r"
    CREATE TABLE IF NOT EXISTS eventide_index_definitions (
        index_name     TEXT        PRIMARY KEY,
        definition     JSONB       NOT NULL
    )",
    r"
    CREATE TABLE IF NOT EXISTS eventide_documents (
        index_name     TEXT        NOT NULL REFERENCES eventide_index_definitions (index_name),
        partition_key  TEXT        NOT NULL,
        id             TEXT        NOT NULL,
        document       JSONB       NOT NULL,
        revision       BIGINT      NOT NULL DEFAULT 0,
        PRIMARY KEY (index_name, partition_key, id)
    )",
    r"
    CREATE TABLE IF NOT EXISTS eventide_index_state (
        index_name     TEXT        PRIMARY KEY,
        requires_rebuild BOOLEAN   NOT NULL,
        status         JSONB       NOT NULL
    )",
    r"
    CREATE INDEX IF NOT EXISTS eventide_index_state_pending
        ON eventide_index_state (index_name) WHERE requires_rebuild",
];
