//! SQLite database for VRT state persistence

use crate::store::*;
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                main_branch_name TEXT NOT NULL,
                auto_approve_feature INTEGER NOT NULL DEFAULT 0,
                image_comparison TEXT NOT NULL,
                image_comparison_config TEXT NOT NULL DEFAULT '',
                max_build_allowed INTEGER NOT NULL,
                max_branch_lifetime INTEGER NOT NULL,
                builds_counter INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                ci_build_id TEXT,
                branch_name TEXT NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 1,
                number INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_builds_ci_build ON builds(project_id, ci_build_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_builds_number ON builds(project_id, number);

            CREATE TABLE IF NOT EXISTS test_variations (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                os TEXT NOT NULL DEFAULT '',
                browser TEXT NOT NULL DEFAULT '',
                viewport TEXT NOT NULL DEFAULT '',
                device TEXT NOT NULL DEFAULT '',
                custom_tags TEXT NOT NULL DEFAULT '',
                branch_name TEXT NOT NULL,
                baseline_name TEXT,
                ignore_regions TEXT NOT NULL DEFAULT '[]',
                comment TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(project_id, name, os, browser, viewport, device, custom_tags, branch_name)
            );
            CREATE INDEX IF NOT EXISTS idx_test_variations_branch ON test_variations(project_id, branch_name);

            CREATE TABLE IF NOT EXISTS baselines (
                id TEXT PRIMARY KEY,
                test_variation_id TEXT NOT NULL,
                baseline_name TEXT NOT NULL,
                test_run_id TEXT,
                user_id TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_baselines_variation ON baselines(test_variation_id);

            CREATE TABLE IF NOT EXISTS test_runs (
                id TEXT PRIMARY KEY,
                build_id TEXT NOT NULL,
                test_variation_id TEXT,
                name TEXT NOT NULL,
                os TEXT NOT NULL DEFAULT '',
                browser TEXT NOT NULL DEFAULT '',
                viewport TEXT NOT NULL DEFAULT '',
                device TEXT NOT NULL DEFAULT '',
                custom_tags TEXT NOT NULL DEFAULT '',
                image_name TEXT NOT NULL,
                baseline_name TEXT,
                diff_name TEXT,
                diff_tolerance_percent REAL NOT NULL DEFAULT 0,
                pixel_mismatch_count INTEGER,
                diff_percent REAL,
                same_dimension INTEGER,
                status TEXT NOT NULL,
                ignore_regions TEXT NOT NULL DEFAULT '[]',
                temp_ignore_regions TEXT NOT NULL DEFAULT '[]',
                comment TEXT,
                branch_name TEXT NOT NULL,
                baseline_branch_name TEXT,
                merge INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_runs_build ON test_runs(build_id);
            CREATE INDEX IF NOT EXISTS idx_test_runs_variation ON test_runs(test_variation_id);
            CREATE INDEX IF NOT EXISTS idx_test_runs_baseline ON test_runs(baseline_name, status);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

const PROJECT_COLUMNS: &str = "id, name, main_branch_name, auto_approve_feature, image_comparison, \
     image_comparison_config, max_build_allowed, max_branch_lifetime, builds_counter, created_at, updated_at";

const BUILD_COLUMNS: &str =
    "id, project_id, ci_build_id, branch_name, is_running, number, created_at, updated_at";

const VARIATION_COLUMNS: &str = "id, project_id, name, os, browser, viewport, device, custom_tags, \
     branch_name, baseline_name, ignore_regions, comment, created_at, updated_at";

const BASELINE_COLUMNS: &str = "id, test_variation_id, baseline_name, test_run_id, user_id, created_at";

const TEST_RUN_COLUMNS: &str = "id, build_id, test_variation_id, name, os, browser, viewport, device, \
     custom_tags, image_name, baseline_name, diff_name, diff_tolerance_percent, pixel_mismatch_count, \
     diff_percent, same_dimension, status, ignore_regions, temp_ignore_regions, comment, branch_name, \
     baseline_branch_name, merge, created_at, updated_at";

fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn regions_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<IgnoreRegion>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn identity_at(row: &Row<'_>, start: usize) -> rusqlite::Result<TestIdentity> {
    Ok(TestIdentity {
        name: row.get(start)?,
        os: row.get(start + 1)?,
        browser: row.get(start + 2)?,
        viewport: row.get(start + 3)?,
        device: row.get(start + 4)?,
        custom_tags: row.get(start + 5)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        main_branch_name: row.get(2)?,
        auto_approve_feature: row.get(3)?,
        image_comparison: parsed_at(row, 4)?,
        image_comparison_config: row.get(5)?,
        max_build_allowed: row.get(6)?,
        max_branch_lifetime: row.get(7)?,
        builds_counter: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        updated_at: from_millis(row.get(10)?),
    })
}

fn build_from_row(row: &Row<'_>) -> rusqlite::Result<Build> {
    Ok(Build {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        ci_build_id: row.get(2)?,
        branch_name: row.get(3)?,
        is_running: row.get(4)?,
        number: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

fn variation_from_row(row: &Row<'_>) -> rusqlite::Result<TestVariation> {
    Ok(TestVariation {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        identity: identity_at(row, 2)?,
        branch_name: row.get(8)?,
        baseline_name: row.get(9)?,
        ignore_regions: regions_at(row, 10)?,
        comment: row.get(11)?,
        created_at: from_millis(row.get(12)?),
        updated_at: from_millis(row.get(13)?),
    })
}

fn baseline_from_row(row: &Row<'_>) -> rusqlite::Result<Baseline> {
    Ok(Baseline {
        id: uuid_at(row, 0)?,
        test_variation_id: uuid_at(row, 1)?,
        baseline_name: row.get(2)?,
        test_run_id: opt_uuid_at(row, 3)?,
        user_id: row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

fn test_run_from_row(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    let mismatch: Option<i64> = row.get(13)?;
    Ok(TestRun {
        id: uuid_at(row, 0)?,
        build_id: uuid_at(row, 1)?,
        test_variation_id: opt_uuid_at(row, 2)?,
        identity: identity_at(row, 3)?,
        image_name: row.get(9)?,
        baseline_name: row.get(10)?,
        diff_name: row.get(11)?,
        diff_tolerance_percent: row.get(12)?,
        pixel_mismatch_count: mismatch.map(|m| m.max(0) as u64),
        diff_percent: row.get(14)?,
        same_dimension: row.get(15)?,
        status: parsed_at(row, 16)?,
        ignore_regions: regions_at(row, 17)?,
        temp_ignore_regions: regions_at(row, 18)?,
        comment: row.get(19)?,
        branch_name: row.get(20)?,
        baseline_branch_name: row.get(21)?,
        merge: row.get(22)?,
        created_at: from_millis(row.get(23)?),
        updated_at: from_millis(row.get(24)?),
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn select_build(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Build>> {
    conn.query_row(
        &format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS),
        params![id.to_string()],
        build_from_row,
    )
    .optional()
}

fn select_variation(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<TestVariation>> {
    conn.query_row(
        &format!("SELECT {} FROM test_variations WHERE id = ?1", VARIATION_COLUMNS),
        params![id.to_string()],
        variation_from_row,
    )
    .optional()
}

fn select_test_run(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<TestRun>> {
    conn.query_row(
        &format!("SELECT {} FROM test_runs WHERE id = ?1", TEST_RUN_COLUMNS),
        params![id.to_string()],
        test_run_from_row,
    )
    .optional()
}

// ============================================================================
// Projects
// ============================================================================

impl ProjectRepository for Database {
    fn insert_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO projects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                PROJECT_COLUMNS
            ),
            params![
                project.id.to_string(),
                project.name,
                project.main_branch_name,
                project.auto_approve_feature,
                project.image_comparison.to_string(),
                project.image_comparison_config,
                project.max_build_allowed,
                project.max_branch_lifetime,
                project.builds_counter,
                to_millis(&project.created_at),
                to_millis(&project.updated_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists {
                    kind: "project".to_string(),
                    id: project.id.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        debug!("Inserted project {} ({})", project.name, project.id);
        Ok(())
    }

    fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        let project = conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id.to_string()],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects ORDER BY created_at ASC",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], project_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn.lock();
        // builds_counter is owned by claim_build_number and never written here
        let rows = conn.execute(
            "UPDATE projects SET name = ?1, main_branch_name = ?2, auto_approve_feature = ?3,
                 image_comparison = ?4, image_comparison_config = ?5, max_build_allowed = ?6,
                 max_branch_lifetime = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                project.name,
                project.main_branch_name,
                project.auto_approve_feature,
                project.image_comparison.to_string(),
                project.image_comparison_config,
                project.max_build_allowed,
                project.max_branch_lifetime,
                to_millis(&now_millis()),
                project.id.to_string(),
            ],
        )?;
        if rows == 0 {
            return Err(Error::not_found("project", project.id));
        }
        Ok(())
    }
}

// ============================================================================
// Builds
// ============================================================================

impl BuildRepository for Database {
    fn insert_build_or_conflict(&self, build: &Build) -> Result<InsertOutcome<Build>> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO builds ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                BUILD_COLUMNS
            ),
            params![
                build.id.to_string(),
                build.project_id.to_string(),
                build.ci_build_id,
                build.branch_name,
                build.is_running,
                build.number,
                to_millis(&build.created_at),
                to_millis(&build.updated_at),
            ],
        );

        match result {
            Ok(_) => {
                debug!("Inserted build {}", build.id);
                Ok(InsertOutcome::Inserted(build.clone()))
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    "Build insert conflicted on ci build id {:?} in project {}",
                    build.ci_build_id, build.project_id
                );
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_build(&self, id: Uuid) -> Result<Option<Build>> {
        let conn = self.conn.lock();
        Ok(select_build(&conn, id)?)
    }

    fn find_build_by_ci_id(&self, project_id: Uuid, ci_build_id: &str) -> Result<Option<Build>> {
        let conn = self.conn.lock();
        let build = conn
            .query_row(
                &format!(
                    "SELECT {} FROM builds WHERE project_id = ?1 AND ci_build_id = ?2",
                    BUILD_COLUMNS
                ),
                params![project_id.to_string(), ci_build_id],
                build_from_row,
            )
            .optional()?;
        Ok(build)
    }

    fn mark_build_running_by_ci_id(&self, project_id: Uuid, ci_build_id: &str) -> Result<Option<Build>> {
        let conn = self.conn.lock();
        let build = conn
            .query_row(
                &format!(
                    "UPDATE builds SET is_running = 1, updated_at = ?1
                     WHERE project_id = ?2 AND ci_build_id = ?3
                     RETURNING {}",
                    BUILD_COLUMNS
                ),
                params![to_millis(&now_millis()), project_id.to_string(), ci_build_id],
                build_from_row,
            )
            .optional()?;
        Ok(build)
    }

    fn set_build_running(&self, id: Uuid, running: bool) -> Result<Option<Build>> {
        let conn = self.conn.lock();
        let build = conn
            .query_row(
                &format!(
                    "UPDATE builds SET is_running = ?1, updated_at = ?2 WHERE id = ?3 RETURNING {}",
                    BUILD_COLUMNS
                ),
                params![running, to_millis(&now_millis()), id.to_string()],
                build_from_row,
            )
            .optional()?;
        Ok(build)
    }

    fn claim_build_number(&self, id: Uuid) -> Result<Option<Build>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(build) = select_build(&tx, id)? else {
            return Ok(None);
        };

        if build.number.is_none() {
            let now = to_millis(&now_millis());
            let counter: i64 = tx.query_row(
                "UPDATE projects SET builds_counter = builds_counter + 1, updated_at = ?1
                 WHERE id = ?2
                 RETURNING builds_counter",
                params![now, build.project_id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE builds SET number = ?1, updated_at = ?2 WHERE id = ?3 AND number IS NULL",
                params![counter, now, id.to_string()],
            )?;
            debug!("Assigned number {} to build {}", counter, id);
        }

        let claimed = select_build(&tx, id)?;
        tx.commit()?;
        Ok(claimed)
    }

    fn list_builds(&self, project_id: Uuid) -> Result<Vec<Build>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM builds WHERE project_id = ?1 ORDER BY created_at DESC, rowid DESC",
            BUILD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id.to_string()], build_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_build(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM builds WHERE id = ?1", params![id.to_string()])?;
        if rows > 0 {
            debug!("Deleted build {}", id);
        }
        Ok(rows > 0)
    }
}

// ============================================================================
// Test variations
// ============================================================================

impl TestVariationRepository for Database {
    fn insert_variation_or_conflict(&self, variation: &TestVariation) -> Result<InsertOutcome<TestVariation>> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO test_variations ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                VARIATION_COLUMNS
            ),
            params![
                variation.id.to_string(),
                variation.project_id.to_string(),
                variation.identity.name,
                variation.identity.os,
                variation.identity.browser,
                variation.identity.viewport,
                variation.identity.device,
                variation.identity.custom_tags,
                variation.branch_name,
                variation.baseline_name,
                serde_json::to_string(&variation.ignore_regions)?,
                variation.comment,
                to_millis(&variation.created_at),
                to_millis(&variation.updated_at),
            ],
        );

        match result {
            Ok(_) => {
                debug!("Inserted test variation {} ({})", variation.identity, variation.id);
                Ok(InsertOutcome::Inserted(variation.clone()))
            }
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    fn get_variation(&self, id: Uuid) -> Result<Option<TestVariation>> {
        let conn = self.conn.lock();
        Ok(select_variation(&conn, id)?)
    }

    fn find_variation(
        &self,
        project_id: Uuid,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<Option<TestVariation>> {
        let conn = self.conn.lock();
        let variation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM test_variations
                     WHERE project_id = ?1 AND name = ?2 AND os = ?3 AND browser = ?4
                       AND viewport = ?5 AND device = ?6 AND custom_tags = ?7 AND branch_name = ?8",
                    VARIATION_COLUMNS
                ),
                params![
                    project_id.to_string(),
                    identity.name,
                    identity.os,
                    identity.browser,
                    identity.viewport,
                    identity.device,
                    identity.custom_tags,
                    branch_name,
                ],
                variation_from_row,
            )
            .optional()?;
        Ok(variation)
    }

    fn update_variation(&self, variation: &TestVariation) -> Result<TestVariation> {
        let conn = self.conn.lock();
        let updated = conn
            .query_row(
                &format!(
                    "UPDATE test_variations
                     SET baseline_name = ?1, ignore_regions = ?2, comment = ?3, updated_at = ?4
                     WHERE id = ?5
                     RETURNING {}",
                    VARIATION_COLUMNS
                ),
                params![
                    variation.baseline_name,
                    serde_json::to_string(&variation.ignore_regions)?,
                    variation.comment,
                    to_millis(&now_millis()),
                    variation.id.to_string(),
                ],
                variation_from_row,
            )
            .optional()?;
        updated.ok_or_else(|| Error::not_found("test variation", variation.id))
    }

    fn list_variations(&self, project_id: Uuid, branch_name: Option<&str>) -> Result<Vec<TestVariation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_variations
             WHERE project_id = ?1 AND (?2 IS NULL OR branch_name = ?2)
             ORDER BY name ASC, created_at ASC",
            VARIATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id.to_string(), branch_name], variation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_stale_variations(
        &self,
        project_id: Uuid,
        main_branch_name: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<TestVariation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_variations
             WHERE project_id = ?1 AND branch_name != ?2 AND updated_at <= ?3",
            VARIATION_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![project_id.to_string(), main_branch_name, to_millis(&before)],
            variation_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_variation(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM test_variations WHERE id = ?1",
            params![id.to_string()],
        )?;
        if rows > 0 {
            debug!("Deleted test variation {}", id);
        }
        Ok(rows > 0)
    }
}

// ============================================================================
// Baselines
// ============================================================================

impl BaselineRepository for Database {
    fn add_baseline(&self, baseline: &Baseline) -> Result<TestVariation> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let now = to_millis(&now_millis());
        let rows = tx.execute(
            "UPDATE test_variations SET baseline_name = ?1, updated_at = ?2 WHERE id = ?3",
            params![baseline.baseline_name, now, baseline.test_variation_id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::Integrity(format!(
                "cannot attach baseline to missing test variation {}",
                baseline.test_variation_id
            )));
        }

        tx.execute(
            &format!(
                "INSERT INTO baselines ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                BASELINE_COLUMNS
            ),
            params![
                baseline.id.to_string(),
                baseline.test_variation_id.to_string(),
                baseline.baseline_name,
                baseline.test_run_id.map(|id| id.to_string()),
                baseline.user_id,
                to_millis(&baseline.created_at),
            ],
        )?;

        let variation = select_variation(&tx, baseline.test_variation_id)?
            .ok_or_else(|| Error::not_found("test variation", baseline.test_variation_id))?;
        tx.commit()?;

        debug!(
            "Baseline {} is now current for test variation {}",
            baseline.baseline_name, baseline.test_variation_id
        );
        Ok(variation)
    }

    fn list_baselines(&self, test_variation_id: Uuid) -> Result<Vec<Baseline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM baselines WHERE test_variation_id = ?1
             ORDER BY created_at DESC, rowid DESC",
            BASELINE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![test_variation_id.to_string()], baseline_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_baselines(&self, test_variation_id: Uuid) -> Result<Vec<Baseline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM baselines WHERE test_variation_id = ?1 RETURNING {}",
            BASELINE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![test_variation_id.to_string()], baseline_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ============================================================================
// Test runs
// ============================================================================

impl TestRunRepository for Database {
    fn insert_test_run(&self, run: &TestRun) -> Result<()> {
        let conn = self.conn.lock();
        insert_test_run_row(&conn, run)?;
        debug!("Inserted test run {} for {}", run.id, run.identity);
        Ok(())
    }

    fn insert_test_run_superseding(&self, run: &TestRun) -> Result<Vec<TestRun>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let superseded = select_pending_test_runs(&tx, run.build_id, &run.identity, &run.branch_name)?;
        for previous in &superseded {
            tx.execute("DELETE FROM test_runs WHERE id = ?1", params![previous.id.to_string()])?;
        }
        insert_test_run_row(&tx, run)?;
        tx.commit()?;

        debug!(
            "Inserted test run {} for {}, superseding {}",
            run.id,
            run.identity,
            superseded.len()
        );
        Ok(superseded)
    }

    fn get_test_run(&self, id: Uuid) -> Result<Option<TestRun>> {
        let conn = self.conn.lock();
        Ok(select_test_run(&conn, id)?)
    }

    fn update_test_run(&self, run: &TestRun) -> Result<TestRun> {
        let conn = self.conn.lock();
        let updated = conn
            .query_row(
                &format!(
                    "UPDATE test_runs
                     SET test_variation_id = ?1, baseline_name = ?2, diff_name = ?3,
                         pixel_mismatch_count = ?4, diff_percent = ?5, same_dimension = ?6,
                         status = ?7, ignore_regions = ?8, temp_ignore_regions = ?9,
                         comment = ?10, updated_at = ?11
                     WHERE id = ?12
                     RETURNING {}",
                    TEST_RUN_COLUMNS
                ),
                params![
                    run.test_variation_id.map(|id| id.to_string()),
                    run.baseline_name,
                    run.diff_name,
                    run.pixel_mismatch_count.map(|m| m as i64),
                    run.diff_percent,
                    run.same_dimension,
                    run.status.to_string(),
                    serde_json::to_string(&run.ignore_regions)?,
                    serde_json::to_string(&run.temp_ignore_regions)?,
                    run.comment,
                    to_millis(&now_millis()),
                    run.id.to_string(),
                ],
                test_run_from_row,
            )
            .optional()?;
        updated.ok_or_else(|| Error::not_found("test run", run.id))
    }

    fn delete_test_run(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM test_runs WHERE id = ?1", params![id.to_string()])?;
        if rows > 0 {
            debug!("Deleted test run {}", id);
        }
        Ok(rows > 0)
    }

    fn find_pending_test_runs(
        &self,
        build_id: Uuid,
        identity: &TestIdentity,
        branch_name: &str,
    ) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        select_pending_test_runs(&conn, build_id, identity, branch_name)
    }

    fn find_approved_test_runs(
        &self,
        project_id: Uuid,
        identity: &TestIdentity,
        baseline_name: &str,
    ) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let columns = TEST_RUN_COLUMNS
            .split(", ")
            .map(|c| format!("r.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs r
             JOIN test_variations v ON v.id = r.test_variation_id
             WHERE v.project_id = ?1 AND r.name = ?2 AND r.os = ?3 AND r.browser = ?4
               AND r.viewport = ?5 AND r.device = ?6 AND r.custom_tags = ?7
               AND r.baseline_name = ?8 AND r.status = 'approved'
             ORDER BY r.created_at DESC",
            columns
        ))?;
        let rows = stmt.query_map(
            params![
                project_id.to_string(),
                identity.name,
                identity.os,
                identity.browser,
                identity.viewport,
                identity.device,
                identity.custom_tags,
                baseline_name,
            ],
            test_run_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_test_runs_by_build(&self, build_id: Uuid) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs WHERE build_id = ?1 ORDER BY created_at ASC",
            TEST_RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![build_id.to_string()], test_run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_test_runs_by_variation(&self, test_variation_id: Uuid) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs WHERE test_variation_id = ?1 ORDER BY created_at ASC",
            TEST_RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![test_variation_id.to_string()], test_run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Runs for the same build, identity and branch that are not approved
fn select_pending_test_runs(
    conn: &Connection,
    build_id: Uuid,
    identity: &TestIdentity,
    branch_name: &str,
) -> Result<Vec<TestRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM test_runs
         WHERE build_id = ?1 AND name = ?2 AND os = ?3 AND browser = ?4 AND viewport = ?5
           AND device = ?6 AND custom_tags = ?7 AND branch_name = ?8
           AND status NOT IN ('approved', 'autoApproved')
         ORDER BY created_at DESC",
        TEST_RUN_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![
            build_id.to_string(),
            identity.name,
            identity.os,
            identity.browser,
            identity.viewport,
            identity.device,
            identity.custom_tags,
            branch_name,
        ],
        test_run_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn insert_test_run_row(conn: &Connection, run: &TestRun) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO test_runs ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            TEST_RUN_COLUMNS
        ),
        params![
            run.id.to_string(),
            run.build_id.to_string(),
            run.test_variation_id.map(|id| id.to_string()),
            run.identity.name,
            run.identity.os,
            run.identity.browser,
            run.identity.viewport,
            run.identity.device,
            run.identity.custom_tags,
            run.image_name,
            run.baseline_name,
            run.diff_name,
            run.diff_tolerance_percent,
            run.pixel_mismatch_count.map(|m| m as i64),
            run.diff_percent,
            run.same_dimension,
            run.status.to_string(),
            serde_json::to_string(&run.ignore_regions)?,
            serde_json::to_string(&run.temp_ignore_regions)?,
            run.comment,
            run.branch_name,
            run.baseline_branch_name,
            run.merge,
            to_millis(&run.created_at),
            to_millis(&run.updated_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, Project) {
        let db = Database::open_memory().unwrap();
        let project = Project::new("web").with_main_branch("main");
        db.insert_project(&project).unwrap();
        (db, project)
    }

    fn run_for(build: &Build, variation: &TestVariation, status: TestStatus) -> TestRun {
        let now = now_millis();
        TestRun {
            id: Uuid::new_v4(),
            build_id: build.id,
            test_variation_id: Some(variation.id),
            identity: variation.identity.clone(),
            image_name: format!("screenshot-{}.png", Uuid::new_v4()),
            baseline_name: variation.baseline_name.clone(),
            diff_name: None,
            diff_tolerance_percent: 0.0,
            pixel_mismatch_count: None,
            diff_percent: None,
            same_dimension: None,
            status,
            ignore_regions: vec![IgnoreRegion::new(0, 0, 5, 5)],
            temp_ignore_regions: Vec::new(),
            comment: None,
            branch_name: build.branch_name.clone(),
            baseline_branch_name: Some(variation.branch_name.clone()),
            merge: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_project_crud() {
        let (db, project) = seeded();

        let loaded = db.get_project(project.id).unwrap().unwrap();
        assert_eq!(loaded.main_branch_name, "main");
        assert_eq!(loaded.image_comparison, ImageComparison::Pixelmatch);

        let mut changed = loaded.clone();
        changed.auto_approve_feature = true;
        db.update_project(&changed).unwrap();
        assert!(db.get_project(project.id).unwrap().unwrap().auto_approve_feature);

        assert_eq!(db.list_projects().unwrap().len(), 1);
        assert!(db.get_project(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_build_insert_conflicts_on_ci_build_id() {
        let (db, project) = seeded();

        let first = Build::new(project.id, "feature", Some("ci-1".to_string()));
        let second = Build::new(project.id, "feature", Some("ci-1".to_string()));

        assert!(matches!(
            db.insert_build_or_conflict(&first).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(db.insert_build_or_conflict(&second).unwrap(), InsertOutcome::Conflict);

        // Builds without an external id never collide
        let a = Build::new(project.id, "feature", None);
        let b = Build::new(project.id, "feature", None);
        assert!(db.insert_build_or_conflict(&a).unwrap().inserted().is_some());
        assert!(db.insert_build_or_conflict(&b).unwrap().inserted().is_some());
    }

    #[test]
    fn test_claim_build_number_assigns_once() {
        let (db, project) = seeded();
        let build = Build::new(project.id, "main", None);
        db.insert_build_or_conflict(&build).unwrap();

        let first = db.claim_build_number(build.id).unwrap().unwrap();
        let again = db.claim_build_number(build.id).unwrap().unwrap();
        assert_eq!(first.number, Some(1));
        assert_eq!(again.number, Some(1));
        assert_eq!(db.get_project(project.id).unwrap().unwrap().builds_counter, 1);

        assert!(db.claim_build_number(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_build_numbers_not_reused_after_delete() {
        let (db, project) = seeded();
        let first = Build::new(project.id, "main", None);
        db.insert_build_or_conflict(&first).unwrap();
        db.claim_build_number(first.id).unwrap();
        assert!(db.delete_build(first.id).unwrap());
        assert!(!db.delete_build(first.id).unwrap());

        let second = Build::new(project.id, "main", None);
        db.insert_build_or_conflict(&second).unwrap();
        let claimed = db.claim_build_number(second.id).unwrap().unwrap();
        assert_eq!(claimed.number, Some(2));
    }

    #[test]
    fn test_mark_running_by_ci_id() {
        let (db, project) = seeded();
        let build = Build::new(project.id, "main", Some("ci-9".to_string()));
        db.insert_build_or_conflict(&build).unwrap();
        db.set_build_running(build.id, false).unwrap();

        let marked = db.mark_build_running_by_ci_id(project.id, "ci-9").unwrap().unwrap();
        assert!(marked.is_running);
        assert!(db.mark_build_running_by_ci_id(project.id, "missing").unwrap().is_none());
    }

    #[test]
    fn test_variation_natural_key_is_unique() {
        let (db, project) = seeded();
        let identity = TestIdentity::new("home").with_browser("firefox");

        let main = TestVariation::new(project.id, identity.clone(), "main");
        let duplicate = TestVariation::new(project.id, identity.clone(), "main");
        let feature = TestVariation::new(project.id, identity.clone(), "feature");

        assert!(db.insert_variation_or_conflict(&main).unwrap().inserted().is_some());
        assert_eq!(
            db.insert_variation_or_conflict(&duplicate).unwrap(),
            InsertOutcome::Conflict
        );
        assert!(db.insert_variation_or_conflict(&feature).unwrap().inserted().is_some());

        let found = db.find_variation(project.id, &identity, "main").unwrap().unwrap();
        assert_eq!(found.id, main.id);
        let other_browser = identity.clone().with_browser("chrome");
        assert!(db.find_variation(project.id, &other_browser, "main").unwrap().is_none());
    }

    #[test]
    fn test_add_baseline_moves_current_pointer() {
        let (db, project) = seeded();
        let variation = TestVariation::new(project.id, TestIdentity::new("cart"), "main");
        db.insert_variation_or_conflict(&variation).unwrap();

        db.add_baseline(&Baseline::new(variation.id, "baseline-a.png", None, None))
            .unwrap();
        let updated = db
            .add_baseline(&Baseline::new(variation.id, "baseline-b.png", None, Some("alice".into())))
            .unwrap();
        assert_eq!(updated.baseline_name.as_deref(), Some("baseline-b.png"));

        let history = db.list_baselines(variation.id).unwrap();
        let names: Vec<_> = history.iter().map(|b| b.baseline_name.as_str()).collect();
        assert_eq!(names, vec!["baseline-b.png", "baseline-a.png"]);

        let orphan = Baseline::new(Uuid::new_v4(), "baseline-c.png", None, None);
        assert!(matches!(db.add_baseline(&orphan), Err(Error::Integrity(_))));

        let removed = db.delete_baselines(variation.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(db.list_baselines(variation.id).unwrap().is_empty());
    }

    #[test]
    fn test_pending_runs_exclude_approved() {
        let (db, project) = seeded();
        let build = Build::new(project.id, "main", None);
        db.insert_build_or_conflict(&build).unwrap();
        let variation = TestVariation::new(project.id, TestIdentity::new("menu"), "main");
        db.insert_variation_or_conflict(&variation).unwrap();

        let unresolved = run_for(&build, &variation, TestStatus::Unresolved);
        let approved = run_for(&build, &variation, TestStatus::Approved);
        db.insert_test_run(&unresolved).unwrap();
        db.insert_test_run(&approved).unwrap();

        let pending = db
            .find_pending_test_runs(build.id, &variation.identity, "main")
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unresolved.id);
        assert_eq!(pending[0].ignore_regions, vec![IgnoreRegion::new(0, 0, 5, 5)]);
    }

    #[test]
    fn test_superseding_insert_replaces_pending_runs() {
        let (db, project) = seeded();
        let build = Build::new(project.id, "main", None);
        db.insert_build_or_conflict(&build).unwrap();
        let variation = TestVariation::new(project.id, TestIdentity::new("menu"), "main");
        db.insert_variation_or_conflict(&variation).unwrap();

        let unresolved = run_for(&build, &variation, TestStatus::Unresolved);
        let approved = run_for(&build, &variation, TestStatus::Approved);
        db.insert_test_run(&unresolved).unwrap();
        db.insert_test_run(&approved).unwrap();

        let fresh = run_for(&build, &variation, TestStatus::New);
        let superseded = db.insert_test_run_superseding(&fresh).unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, unresolved.id);

        assert!(db.get_test_run(unresolved.id).unwrap().is_none());
        assert!(db.get_test_run(approved.id).unwrap().is_some());
        let pending = db
            .find_pending_test_runs(build.id, &variation.identity, "main")
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);

        // Nothing pending on another branch
        let mut other = run_for(&build, &variation, TestStatus::New);
        other.branch_name = "feature".to_string();
        assert!(db.insert_test_run_superseding(&other).unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_run_is_not_found() {
        let (db, project) = seeded();
        let build = Build::new(project.id, "main", None);
        let variation = TestVariation::new(project.id, TestIdentity::new("menu"), "main");
        let run = run_for(&build, &variation, TestStatus::New);
        assert!(matches!(db.update_test_run(&run), Err(Error::NotFound { .. })));
        assert!(!db.delete_test_run(run.id).unwrap());
    }

    #[test]
    fn test_stale_variations_skip_main_branch() {
        let (db, project) = seeded();
        let main = TestVariation::new(project.id, TestIdentity::new("a"), "main");
        let feature = TestVariation::new(project.id, TestIdentity::new("a"), "feature");
        db.insert_variation_or_conflict(&main).unwrap();
        db.insert_variation_or_conflict(&feature).unwrap();

        let cutoff = now_millis() + chrono::Duration::days(1);
        let stale = db.list_stale_variations(project.id, "main", cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].branch_name, "feature");

        let past = now_millis() - chrono::Duration::days(1);
        assert!(db.list_stale_variations(project.id, "main", past).unwrap().is_empty());
    }
}
