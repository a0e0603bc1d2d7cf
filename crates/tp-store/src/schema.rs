// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative schema of the relational store.
//!
//! The schema lives in the `ca_base` namespace. It is created
//! idempotently at startup; [`SCHEMA_REVISION`] is asserted against the
//! `schema_revision` table so that a store built for a different layout
//! refuses to start instead of corrupting data.

/// Name of the database schema holding all platform tables.
pub const SCHEMA_NAME: &str = "ca_base";

/// Revision of the declarative schema below. Bump on any layout change.
pub const SCHEMA_REVISION: i64 = 1;

/// Name of the unique constraint enforcing computation deduplication.
pub const COMPUTATION_DEDUPLICATION_CONSTRAINT: &str = "computation_deduplication_constraint";

/// Marker that the traceback of an input-validation failure carries;
/// reporting views use it to separate user mistakes from real failures.
pub const INPUT_VALIDATION_MARKER: &str = "INPUT_VALIDATION";

/// AOI-id prefix marking demo computations.
pub const DEMO_PREFIX: &str = "demo-";

/// Idempotent table DDL, executed at startup.
///
/// The deduplication key is a database-computed digest of the requested
/// parameters and the AOI WKT; together with the plugin key and the
/// cache epoch it forms the uniqueness constraint that makes the
/// deduplication decision linearizable. Rows with a NULL cache epoch
/// never conflict, so non-cacheable computations always get fresh rows.
pub const TABLES_DDL: &str = r#"
CREATE EXTENSION IF NOT EXISTS postgis;

CREATE SCHEMA IF NOT EXISTS ca_base;

CREATE TABLE IF NOT EXISTS ca_base.schema_revision (
    revision BIGINT PRIMARY KEY
);

INSERT INTO ca_base.schema_revision (revision)
SELECT 1
WHERE NOT EXISTS (SELECT 1 FROM ca_base.schema_revision);

CREATE TABLE IF NOT EXISTS ca_base.plugin_author (
    name        TEXT PRIMARY KEY,
    affiliation TEXT,
    website     TEXT
);

CREATE TABLE IF NOT EXISTS ca_base.plugin_info (
    key                     TEXT PRIMARY KEY,
    id                      TEXT NOT NULL,
    version                 TEXT NOT NULL,
    latest                  BOOLEAN NOT NULL DEFAULT FALSE,
    name                    TEXT NOT NULL,
    repository              TEXT NOT NULL,
    state                   TEXT NOT NULL,
    concerns                JSONB NOT NULL,
    teaser                  TEXT NOT NULL,
    purpose                 TEXT NOT NULL,
    methodology             TEXT NOT NULL,
    sources                 JSONB,
    demo_config             JSONB NOT NULL,
    computation_shelf_life  BIGINT,
    assets                  JSONB NOT NULL,
    operator_schema         JSONB,
    library_version         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS plugin_info_id_idx ON ca_base.plugin_info (id);

CREATE TABLE IF NOT EXISTS ca_base.plugin_info_author_link (
    info_key    TEXT NOT NULL REFERENCES ca_base.plugin_info (key),
    author_id   TEXT NOT NULL REFERENCES ca_base.plugin_author (name),
    author_seat INTEGER NOT NULL,
    PRIMARY KEY (info_key, author_id)
);

CREATE TABLE IF NOT EXISTS ca_base.computation (
    correlation_uuid  UUID PRIMARY KEY,
    request_ts        TIMESTAMPTZ NOT NULL,
    plugin_key        TEXT NOT NULL REFERENCES ca_base.plugin_info (key),
    deduplication_key UUID GENERATED ALWAYS AS
        (md5(requested_params::text || st_astext(aoi_geom))::uuid) STORED,
    cache_epoch       BIGINT,
    valid_until       TIMESTAMPTZ NOT NULL,
    params            JSONB,
    requested_params  JSONB NOT NULL,
    aoi_geom          geometry(MultiPolygon, 4326) NOT NULL,
    message           TEXT,
    artifact_errors   JSONB NOT NULL DEFAULT '{}'::jsonb,
    completed_ts      TIMESTAMPTZ,
    CONSTRAINT computation_deduplication_constraint
        UNIQUE (plugin_key, deduplication_key, cache_epoch)
);

CREATE INDEX IF NOT EXISTS computation_plugin_key_idx ON ca_base.computation (plugin_key);
CREATE INDEX IF NOT EXISTS computation_valid_until_idx ON ca_base.computation (valid_until);

CREATE TABLE IF NOT EXISTS ca_base.artifact (
    id               BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    correlation_uuid UUID NOT NULL REFERENCES ca_base.computation (correlation_uuid),
    rank             INTEGER NOT NULL,
    name             TEXT NOT NULL,
    modality         TEXT NOT NULL,
    "primary"        BOOLEAN NOT NULL,
    tags             TEXT[] NOT NULL DEFAULT '{}',
    summary          TEXT NOT NULL,
    description      TEXT,
    attachments      JSONB,
    sources          JSONB,
    filename         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS artifact_correlation_uuid_idx ON ca_base.artifact (correlation_uuid);

CREATE TABLE IF NOT EXISTS ca_base.computation_lookup (
    user_correlation_uuid UUID PRIMARY KEY,
    request_ts            TIMESTAMPTZ NOT NULL,
    aoi_name              TEXT NOT NULL,
    aoi_id                TEXT NOT NULL,
    aoi_properties        JSONB,
    is_demo               BOOLEAN GENERATED ALWAYS AS (aoi_id LIKE 'demo-%') STORED,
    computation_id        UUID NOT NULL REFERENCES ca_base.computation (correlation_uuid)
);

CREATE INDEX IF NOT EXISTS computation_lookup_is_demo_idx ON ca_base.computation_lookup (is_demo);

CREATE TABLE IF NOT EXISTS ca_base.broker_taskmeta (
    id        BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    task_id   UUID NOT NULL UNIQUE,
    status    TEXT NOT NULL,
    result    JSONB,
    date_done TIMESTAMPTZ,
    traceback TEXT,
    name      TEXT NOT NULL,
    args      JSONB,
    kwargs    JSONB,
    worker    TEXT,
    retries   INTEGER NOT NULL DEFAULT 0,
    queue     TEXT
);
"#;

/// Read-only reporting views, recreated at startup.
pub const VIEWS_DDL: &str = r#"
CREATE OR REPLACE VIEW ca_base.valid_computations AS
SELECT c.correlation_uuid,
       p.name AS plugin_name,
       c.aoi_geom AS aoi,
       c.params
FROM ca_base.computation c
JOIN ca_base.plugin_info p ON c.plugin_key = p.key
JOIN ca_base.broker_taskmeta t ON t.task_id = c.correlation_uuid
WHERE p.latest
  AND c.valid_until > now()
  AND t.status = 'success';

CREATE OR REPLACE VIEW ca_base.computations_summary AS
SELECT p.id AS plugin_id,
       p.version AS plugin_version,
       count(*) AS no_of_computations,
       count(*) FILTER (WHERE t.status = 'success') AS no_of_successes,
       count(*) FILTER (WHERE t.status = 'failure'
                          AND coalesce(t.traceback, '') NOT LIKE '%INPUT_VALIDATION%')
           AS no_of_failures,
       round(100.0
             * (count(*) FILTER (WHERE t.status = 'failure'
                                   AND coalesce(t.traceback, '') NOT LIKE '%INPUT_VALIDATION%'))::numeric
             / nullif(count(*) FILTER (WHERE t.status = 'success'
                                          OR (t.status = 'failure'
                                              AND coalesce(t.traceback, '') NOT LIKE '%INPUT_VALIDATION%')),
                      0),
             2) AS percent_failed,
       min(t.date_done) AS since,
       count(*) FILTER (WHERE coalesce(t.traceback, '') LIKE '%INPUT_VALIDATION%')
           AS no_of_input_validation_fails,
       count(*) FILTER (WHERE t.status IS DISTINCT FROM 'success'
                          AND t.status IS DISTINCT FROM 'failure')
           AS no_of_other_states
FROM ca_base.plugin_info p
JOIN ca_base.computation c ON c.plugin_key = p.key
LEFT JOIN ca_base.broker_taskmeta t ON t.task_id = c.correlation_uuid
GROUP BY p.id, p.version
ORDER BY p.id, p.version DESC;

CREATE OR REPLACE VIEW ca_base.usage_summary AS
SELECT p.id AS plugin_id,
       count(*) AS no_of_requested_computations,
       round(count(*)::numeric
             / greatest(1, (now()::date - min(l.request_ts)::date)),
             2) AS avg_computations_per_day,
       min(l.request_ts) AS since
FROM ca_base.plugin_info p
JOIN ca_base.computation c ON c.plugin_key = p.key
JOIN ca_base.computation_lookup l ON l.computation_id = c.correlation_uuid
WHERE NOT l.is_demo
GROUP BY p.id
ORDER BY count(*) DESC, p.id;

CREATE OR REPLACE VIEW ca_base.failed_computations AS
SELECT p.id AS plugin_id,
       count(*) AS no_of_failures_in_last_30_days,
       left(coalesce(c.message, t.traceback), 10) AS cause,
       array_agg(DISTINCT t.date_done::date) AS on_days,
       array_agg(DISTINCT p.version) AS in_versions,
       array_agg(DISTINCT c.message) AS with_messages,
       array_agg(DISTINCT t.traceback) AS with_tracebacks
FROM ca_base.plugin_info p
JOIN ca_base.computation c ON c.plugin_key = p.key
LEFT JOIN ca_base.broker_taskmeta t ON t.task_id = c.correlation_uuid
WHERE t.status = 'failure'
  AND coalesce(t.traceback, '') NOT LIKE '%INPUT_VALIDATION%'
  AND t.date_done > now() - interval '30 days'
GROUP BY p.id, left(coalesce(c.message, t.traceback), 10)
ORDER BY p.id, count(*) DESC;

CREATE OR REPLACE VIEW ca_base.artifact_errors AS
SELECT p.id AS plugin_id,
       e.key AS artifact,
       count(*) AS no_of_computations_with_errors_in_last_30_days,
       array_agg(DISTINCT t.date_done::date) AS on_days,
       array_agg(DISTINCT p.version) AS in_versions,
       array_agg(DISTINCT e.value) AS with_messages
FROM ca_base.plugin_info p
JOIN ca_base.computation c ON c.plugin_key = p.key
CROSS JOIN LATERAL jsonb_each_text(c.artifact_errors) AS e(key, value)
LEFT JOIN ca_base.broker_taskmeta t ON t.task_id = c.correlation_uuid
WHERE t.date_done > now() - interval '30 days'
GROUP BY p.id, e.key
ORDER BY p.id, e.key, count(*) DESC;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_targets_the_platform_schema() {
        assert!(TABLES_DDL.contains(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA_NAME}")));
        assert!(VIEWS_DDL.contains(&format!("{SCHEMA_NAME}.valid_computations")));
    }

    #[test]
    fn dedup_constraint_name_matches_ddl() {
        assert!(TABLES_DDL.contains(COMPUTATION_DEDUPLICATION_CONSTRAINT));
    }

    #[test]
    fn demo_prefix_matches_generated_column() {
        assert!(TABLES_DDL.contains(&format!("LIKE '{DEMO_PREFIX}%'")));
    }

    #[test]
    fn views_exclude_input_validation_failures() {
        assert!(VIEWS_DDL.contains(INPUT_VALIDATION_MARKER));
    }
}
