// SPDX-License-Identifier: MIT OR Apache-2.0
//! PostgreSQL implementation of the [`ComputationStore`] trait.
//!
//! The deduplication decision is enforced by the database: a
//! single-statement upsert on the
//! `(plugin_key, deduplication_key, cache_epoch)` constraint returns
//! either the freshly inserted row or the pre-existing winner, so
//! concurrent registrations serialise on the constraint rather than on
//! application locks. Long computations never hold a transaction open;
//! every store call here is a short transaction of its own.

use crate::schema::{SCHEMA_REVISION, TABLES_DDL, VIEWS_DDL};
use crate::{ComputationRegistration, ComputationStore, StoreError, TaskMeta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tp_core::{
    cache_slot, far_future, latest_ordering, AoiFeature, AoiProperties, ArtifactEnriched,
    Attachments, ComputationInfo, ComputationState, MultiPolygon, PluginAuthor, PluginInfo,
    PluginRef, ShelfLife,
};
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database, create the schema idempotently, and —
    /// when `assert_schema` is set — refuse to start on a schema
    /// revision mismatch.
    pub async fn connect(
        url: &str,
        user_agent: &str,
        assert_schema: bool,
    ) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .application_name(user_agent);
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(TABLES_DDL).execute(&pool).await?;
        sqlx::raw_sql(VIEWS_DDL).execute(&pool).await?;

        let store = Self { pool };
        if assert_schema {
            store.assert_schema_revision().await?;
        }
        info!(user_agent, "relational store connected");
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn assert_schema_revision(&self) -> Result<(), StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT max(revision) FROM ca_base.schema_revision")
                .fetch_one(&self.pool)
                .await?;
        let found = found.unwrap_or(0);
        if found != SCHEMA_REVISION {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_REVISION,
            });
        }
        Ok(())
    }

    async fn authors_for(&self, info_key: &str) -> Result<Vec<PluginAuthor>, StoreError> {
        let rows = sqlx::query(
            "SELECT a.name, a.affiliation, a.website \
             FROM ca_base.plugin_info_author_link l \
             JOIN ca_base.plugin_author a ON a.name = l.author_id \
             WHERE l.info_key = $1 \
             ORDER BY l.author_seat ASC",
        )
        .bind(info_key)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PluginAuthor {
                    name: row.try_get("name")?,
                    affiliation: row.try_get("affiliation")?,
                    website: row.try_get("website")?,
                })
            })
            .collect()
    }

    async fn info_from_row(&self, row: &PgRow) -> Result<PluginInfo, StoreError> {
        let key: String = row.try_get("key")?;
        let version: String = row.try_get("version")?;
        let library_version: String = row.try_get("library_version")?;
        let state: String = row.try_get("state")?;
        let shelf_life: Option<i64> = row.try_get("computation_shelf_life")?;
        let sources: Option<serde_json::Value> = row.try_get("sources")?;
        let operator_schema: Option<serde_json::Value> = row.try_get("operator_schema")?;

        Ok(PluginInfo {
            id: row.try_get("id")?,
            version: parse_version(&version)?,
            name: row.try_get("name")?,
            authors: self.authors_for(&key).await?,
            repository: row.try_get("repository")?,
            state: enum_from_str(&state)?,
            concerns: from_json(row.try_get("concerns")?)?,
            teaser: row.try_get("teaser")?,
            purpose: row.try_get("purpose")?,
            methodology: row.try_get("methodology")?,
            sources: match sources {
                Some(value) => from_json(value)?,
                None => Vec::new(),
            },
            demo_config: from_json(row.try_get("demo_config")?)?,
            computation_shelf_life: ShelfLife::from(shelf_life.map(|s| s.max(0) as u64)),
            assets: from_json(row.try_get("assets")?)?,
            operator_schema: operator_schema.unwrap_or(serde_json::Value::Null),
            library_version: parse_version(&library_version)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row decoding helpers
// ---------------------------------------------------------------------------

fn parse_version(s: &str) -> Result<Version, StoreError> {
    Version::parse(s).map_err(|e| StoreError::Corrupt(format!("bad version {s:?}: {e}")))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Encode a unit-variant serde enum as its bare string form.
fn enum_to_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Corrupt(format!(
            "expected a string-encoded enum, got {other}"
        ))),
        Err(e) => Err(StoreError::Corrupt(e.to_string())),
    }
}

/// Decode a unit-variant serde enum from its bare string form.
fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Corrupt(format!("bad enum value {s:?}: {e}")))
}

fn artifact_from_row(row: &PgRow) -> Result<ArtifactEnriched, StoreError> {
    let modality: String = row.try_get("modality")?;
    let rank: i32 = row.try_get("rank")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let attachments: Option<serde_json::Value> = row.try_get("attachments")?;
    let sources: Option<serde_json::Value> = row.try_get("sources")?;

    Ok(ArtifactEnriched {
        correlation_uuid: row.try_get("correlation_uuid")?,
        rank: rank.max(0) as u32,
        name: row.try_get("name")?,
        modality: enum_from_str(&modality)?,
        primary: row.try_get("primary")?,
        tags: tags.into_iter().collect::<BTreeSet<_>>(),
        summary: row.try_get("summary")?,
        description: row.try_get("description")?,
        filename: row.try_get("filename")?,
        attachments: match attachments {
            Some(value) => from_json(value)?,
            None => Attachments::default(),
        },
        sources: match sources {
            Some(value) => from_json(value)?,
            None => Vec::new(),
        },
    })
}

fn plugin_ref_from_key(plugin_key: &str) -> Result<PluginRef, StoreError> {
    let (id, version) = plugin_key
        .split_once(';')
        .ok_or_else(|| StoreError::Corrupt(format!("bad plugin key {plugin_key:?}")))?;
    Ok(PluginRef {
        id: id.to_string(),
        version: parse_version(version)?,
    })
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ComputationStore for PgStore {
    async fn write_info(
        &self,
        info: &PluginInfo,
        allow_downgrade: bool,
    ) -> Result<String, StoreError> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT version FROM ca_base.plugin_info WHERE id = $1")
                .bind(&info.id)
                .fetch_all(&self.pool)
                .await?;
        let mut versions = Vec::with_capacity(existing.len());
        for raw in &existing {
            versions.push(parse_version(raw)?);
        }
        if !allow_downgrade {
            if let Some(newest) = versions
                .iter()
                .max_by(|a, b| latest_ordering(a, b))
            {
                if latest_ordering(newest, &info.version) == std::cmp::Ordering::Greater {
                    return Err(StoreError::DowngradeRefused {
                        name: info.name.clone(),
                        version: info.version.clone(),
                        existing: newest.clone(),
                    });
                }
            }
        }

        let key = info.key();
        let mut tx = self.pool.begin().await?;

        for author in &info.authors {
            sqlx::query(
                "INSERT INTO ca_base.plugin_author (name, affiliation, website) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&author.name)
            .bind(&author.affiliation)
            .bind(&author.website)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO ca_base.plugin_info \
               (key, id, version, latest, name, repository, state, concerns, teaser, \
                purpose, methodology, sources, demo_config, computation_shelf_life, \
                assets, operator_schema, library_version) \
             VALUES ($1, $2, $3, FALSE, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (key) DO UPDATE SET \
               name = EXCLUDED.name, repository = EXCLUDED.repository, \
               state = EXCLUDED.state, concerns = EXCLUDED.concerns, \
               teaser = EXCLUDED.teaser, purpose = EXCLUDED.purpose, \
               methodology = EXCLUDED.methodology, sources = EXCLUDED.sources, \
               demo_config = EXCLUDED.demo_config, \
               computation_shelf_life = EXCLUDED.computation_shelf_life, \
               assets = EXCLUDED.assets, operator_schema = EXCLUDED.operator_schema, \
               library_version = EXCLUDED.library_version",
        )
        .bind(&key)
        .bind(&info.id)
        .bind(info.version.to_string())
        .bind(&info.name)
        .bind(&info.repository)
        .bind(enum_to_str(&info.state)?)
        .bind(to_json(&info.concerns)?)
        .bind(&info.teaser)
        .bind(&info.purpose)
        .bind(&info.methodology)
        .bind(to_json(&info.sources)?)
        .bind(to_json(&info.demo_config)?)
        .bind(Option::<u64>::from(info.computation_shelf_life).map(|s| s as i64))
        .bind(to_json(&info.assets)?)
        .bind(if info.operator_schema.is_null() {
            None
        } else {
            Some(info.operator_schema.clone())
        })
        .bind(info.library_version.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM ca_base.plugin_info_author_link WHERE info_key = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        for (seat, author) in info.authors.iter().enumerate() {
            sqlx::query(
                "INSERT INTO ca_base.plugin_info_author_link (info_key, author_id, author_seat) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (info_key, author_id) DO NOTHING",
            )
            .bind(&key)
            .bind(&author.name)
            .bind(seat as i32)
            .execute(&mut *tx)
            .await?;
        }

        // Exactly one version per plugin id carries the latest flag.
        versions.push(info.version.clone());
        let best = versions
            .iter()
            .max_by(|a, b| latest_ordering(a, b))
            .cloned()
            .unwrap_or_else(|| info.version.clone());
        sqlx::query("UPDATE ca_base.plugin_info SET latest = FALSE WHERE id = $1")
            .bind(&info.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE ca_base.plugin_info SET latest = TRUE WHERE key = $1")
            .bind(format!("{};{}", info.id, best))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(plugin = %key, "plugin info written");
        Ok(key)
    }

    async fn read_info(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<PluginInfo, StoreError> {
        let row = match version {
            Some(version) => {
                sqlx::query("SELECT * FROM ca_base.plugin_info WHERE key = $1")
                    .bind(format!("{plugin_id};{version}"))
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM ca_base.plugin_info WHERE id = $1 AND latest")
                    .bind(plugin_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        match row {
            Some(row) => self.info_from_row(&row).await,
            None => Err(StoreError::InfoNotFound {
                plugin_id: plugin_id.to_string(),
            }),
        }
    }

    async fn list_infos(&self) -> Result<Vec<PluginInfo>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ca_base.plugin_info WHERE latest ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut infos = Vec::with_capacity(rows.len());
        for row in &rows {
            infos.push(self.info_from_row(row).await?);
        }
        Ok(infos)
    }

    async fn register_computation(
        &self,
        registration: &ComputationRegistration,
    ) -> Result<Uuid, StoreError> {
        let slot = cache_slot(registration.request_ts, registration.shelf_life);
        let wkt = registration.aoi.to_wkt();

        let mut tx = self.pool.begin().await?;

        // The unique constraint makes concurrent equivalent registrations
        // serialise on one winning row; the no-op update on conflict is
        // what lets RETURNING yield the pre-existing uuid.
        let canonical: Uuid = sqlx::query_scalar(
            "INSERT INTO ca_base.computation \
               (correlation_uuid, request_ts, plugin_key, cache_epoch, valid_until, \
                requested_params, aoi_geom) \
             VALUES ($1, $2, $3, $4, $5, $6, ST_GeomFromText($7, 4326)) \
             ON CONFLICT ON CONSTRAINT computation_deduplication_constraint \
             DO UPDATE SET plugin_key = EXCLUDED.plugin_key \
             RETURNING correlation_uuid",
        )
        .bind(registration.correlation_uuid)
        .bind(registration.request_ts)
        .bind(registration.plugin.key())
        .bind(slot.cache_epoch)
        .bind(slot.valid_until)
        .bind(&registration.requested_params)
        .bind(&wkt)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ca_base.computation_lookup \
               (user_correlation_uuid, request_ts, aoi_name, aoi_id, aoi_properties, computation_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_correlation_uuid) DO NOTHING",
        )
        .bind(registration.correlation_uuid)
        .bind(registration.request_ts)
        .bind(&registration.aoi.properties.name)
        .bind(&registration.aoi.properties.id)
        .bind(to_json(&registration.aoi.properties.extra)?)
        .bind(canonical)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if canonical != registration.correlation_uuid {
            debug!(
                user = %registration.correlation_uuid,
                canonical = %canonical,
                "computation request deduplicated"
            );
        }
        Ok(canonical)
    }

    async fn add_validated_params(
        &self,
        correlation_uuid: Uuid,
        params: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let updated =
            sqlx::query("UPDATE ca_base.computation SET params = $2 WHERE correlation_uuid = $1")
                .bind(correlation_uuid)
                .bind(params)
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ComputationNotFound(correlation_uuid));
        }
        Ok(())
    }

    async fn read_computation(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<ComputationInfo>, StoreError> {
        let row = sqlx::query(
            "SELECT c.correlation_uuid, c.request_ts, c.plugin_key, c.deduplication_key, \
                    c.cache_epoch, c.valid_until, c.params, c.requested_params, \
                    ST_AsGeoJSON(c.aoi_geom)::jsonb AS aoi_geometry, c.message, \
                    c.artifact_errors, c.completed_ts, \
                    l.aoi_name, l.aoi_id, l.aoi_properties, \
                    t.status AS task_status \
             FROM ca_base.computation_lookup l \
             JOIN ca_base.computation c ON c.correlation_uuid = l.computation_id \
             LEFT JOIN ca_base.broker_taskmeta t ON t.task_id = c.correlation_uuid \
             WHERE l.user_correlation_uuid = $1",
        )
        .bind(user_correlation_uuid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let correlation_uuid: Uuid = row.try_get("correlation_uuid")?;
        let plugin_key: String = row.try_get("plugin_key")?;
        let geometry: MultiPolygon = from_json(row.try_get("aoi_geometry")?)?;
        let properties = AoiProperties {
            name: row.try_get("aoi_name")?,
            id: row.try_get("aoi_id")?,
            extra: match row.try_get::<Option<serde_json::Value>, _>("aoi_properties")? {
                Some(value) => from_json::<BTreeMap<String, serde_json::Value>>(value)?,
                None => BTreeMap::new(),
            },
        };
        let status = match row.try_get::<Option<String>, _>("task_status")? {
            Some(raw) => ComputationState::parse(&raw),
            None => Some(ComputationState::Pending),
        };
        let artifact_errors: serde_json::Value = row.try_get("artifact_errors")?;

        Ok(Some(ComputationInfo {
            correlation_uuid,
            request_ts: row.try_get("request_ts")?,
            deduplication_key: row.try_get("deduplication_key")?,
            cache_epoch: row.try_get("cache_epoch")?,
            valid_until: row.try_get("valid_until")?,
            params: row.try_get("params")?,
            requested_params: row.try_get("requested_params")?,
            aoi: AoiFeature::new(geometry, properties),
            artifacts: self.list_artifacts(correlation_uuid).await?,
            plugin: plugin_ref_from_key(&plugin_key)?,
            status,
            message: row.try_get("message")?,
            artifact_errors: from_json(artifact_errors)?,
            completed_ts: row.try_get("completed_ts")?,
        }))
    }

    async fn resolve_computation_id(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT computation_id FROM ca_base.computation_lookup \
             WHERE user_correlation_uuid = $1",
        )
        .bind(user_correlation_uuid)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn update_successful_computation(
        &self,
        info: &ComputationInfo,
        invalidate_cache: bool,
    ) -> Result<(), StoreError> {
        let completed_ts = info.completed_ts.unwrap_or_else(Utc::now);
        let mut tx = self.pool.begin().await?;

        for artifact in &info.artifacts {
            sqlx::query(
                "INSERT INTO ca_base.artifact \
                   (correlation_uuid, rank, name, modality, \"primary\", tags, summary, \
                    description, attachments, sources, filename) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(artifact.correlation_uuid)
            .bind(artifact.rank as i32)
            .bind(&artifact.name)
            .bind(enum_to_str(&artifact.modality)?)
            .bind(artifact.primary)
            .bind(artifact.tags.iter().cloned().collect::<Vec<String>>())
            .bind(&artifact.summary)
            .bind(&artifact.description)
            .bind(if artifact.attachments.is_empty() {
                None
            } else {
                Some(to_json(&artifact.attachments)?)
            })
            .bind(to_json(&artifact.sources)?)
            .bind(&artifact.filename)
            .execute(&mut *tx)
            .await?;
        }

        let updated = if invalidate_cache {
            sqlx::query(
                "UPDATE ca_base.computation SET \
                   message = $2, artifact_errors = $3, completed_ts = $4, params = $5, \
                   cache_epoch = NULL, valid_until = $4 \
                 WHERE correlation_uuid = $1",
            )
        } else {
            sqlx::query(
                "UPDATE ca_base.computation SET \
                   message = $2, artifact_errors = $3, completed_ts = $4, params = $5 \
                 WHERE correlation_uuid = $1",
            )
        }
        .bind(info.correlation_uuid)
        .bind(&info.message)
        .bind(to_json(&info.artifact_errors)?)
        .bind(completed_ts)
        .bind(&info.params)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ComputationNotFound(info.correlation_uuid));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_failed_computation(
        &self,
        correlation_uuid: Uuid,
        message: Option<String>,
        cache: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let (cache_epoch, valid_until): (Option<i64>, DateTime<Utc>) = if cache {
            (Some(0), far_future())
        } else {
            (None, now)
        };

        let updated = sqlx::query(
            "UPDATE ca_base.computation SET \
               message = $2, completed_ts = $3, cache_epoch = $4, valid_until = $5 \
             WHERE correlation_uuid = $1",
        )
        .bind(correlation_uuid)
        .bind(&message)
        .bind(now)
        .bind(cache_epoch)
        .bind(valid_until)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ComputationNotFound(correlation_uuid));
        }
        Ok(())
    }

    async fn list_artifacts(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, StoreError> {
        let rows = sqlx::query(
            "SELECT correlation_uuid, rank, name, modality, \"primary\", tags, summary, \
                    description, attachments, sources, filename \
             FROM ca_base.artifact \
             WHERE correlation_uuid = $1 \
             ORDER BY rank ASC",
        )
        .bind(correlation_uuid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn record_task_result(&self, meta: &TaskMeta) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ca_base.broker_taskmeta \
               (task_id, status, result, date_done, traceback, name, args, kwargs, \
                worker, retries, queue) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (task_id) DO UPDATE SET \
               status = EXCLUDED.status, result = EXCLUDED.result, \
               date_done = EXCLUDED.date_done, traceback = EXCLUDED.traceback, \
               worker = EXCLUDED.worker, retries = EXCLUDED.retries, \
               queue = EXCLUDED.queue",
        )
        .bind(meta.task_id)
        .bind(meta.status.as_str())
        .bind(&meta.result)
        .bind(meta.date_done)
        .bind(&meta.traceback)
        .bind(&meta.name)
        .bind(&meta.args)
        .bind(&meta.kwargs)
        .bind(&meta.worker)
        .bind(meta.retries)
        .bind(&meta.queue)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_task_result(&self, task_id: Uuid) -> Result<Option<TaskMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, status, result, date_done, traceback, name, args, kwargs, \
                    worker, retries, queue \
             FROM ca_base.broker_taskmeta WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        Ok(Some(TaskMeta {
            task_id: row.try_get("task_id")?,
            status: ComputationState::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("bad task status {status:?}")))?,
            result: row.try_get("result")?,
            date_done: row.try_get("date_done")?,
            traceback: row.try_get("traceback")?,
            name: row.try_get("name")?,
            args: row.try_get("args")?,
            kwargs: row.try_get("kwargs")?,
            worker: row.try_get("worker")?,
            retries: row.try_get("retries")?,
            queue: row.try_get("queue")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::{ArtifactModality, PluginState};

    #[test]
    fn enum_string_roundtrip() {
        let s = enum_to_str(&PluginState::Active).unwrap();
        assert_eq!(s, "active");
        let back: PluginState = enum_from_str(&s).unwrap();
        assert_eq!(back, PluginState::Active);
    }

    #[test]
    fn modality_string_roundtrip() {
        let s = enum_to_str(&ArtifactModality::ComputationInfo).unwrap();
        assert_eq!(s, "computation_info");
        let back: ArtifactModality = enum_from_str(&s).unwrap();
        assert_eq!(back, ArtifactModality::ComputationInfo);
    }

    #[test]
    fn plugin_ref_parses_from_key() {
        let parsed = plugin_ref_from_key("tree_cover;3.1.0").unwrap();
        assert_eq!(parsed.id, "tree_cover");
        assert_eq!(parsed.version, Version::new(3, 1, 0));
        assert!(plugin_ref_from_key("no-separator").is_err());
    }
}
