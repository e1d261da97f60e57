use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::model::leverage::LeverageIndexTable;
use crate::model::win_probability::WinProbabilityTable;

pub mod models;
use models::*;

/// Thread-safe SQLite handle for published artifact sets (single connection with mutex)
#[derive(Clone)]
pub struct ArtifactStore {
    conn: Arc<Mutex<Connection>>,
}

impl ArtifactStore {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = ArtifactStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("artifact store connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Artifact sets ────────────────────────────────────────────────────────

    /// Publish a matched WP + LI pair under `version`. Versions are immutable:
    /// publishing an existing one fails and leaves the store untouched.
    pub fn publish(
        &self,
        version: &str,
        wp: &WinProbabilityTable,
        li: &LeverageIndexTable,
    ) -> Result<i64> {
        if wp.rules() != li.rules() {
            bail!("win probability and leverage tables were built under different rules");
        }
        let rules = wp.rules();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM artifact_sets WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;
        if exists {
            bail!("artifact set {version} is already published");
        }

        tx.execute(
            "INSERT INTO artifact_sets (
                version, created_at, regulation_innings, max_run_diff,
                home_extra_inning_win_rate, extra_inning_runner_on_second, leverage_scale
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                version,
                Utc::now(),
                rules.regulation_innings as i64,
                rules.max_run_diff,
                rules.home_extra_inning_win_rate,
                rules.extra_inning_runner_on_second,
                li.scale(),
            ],
        )?;
        let set_id = tx.last_insert_rowid();

        let mut rows = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO game_states (
                    set_id, state_index, inning, half, bases, outs, run_diff, wp, li
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            )?;
            for (index, ((state, wp_value), (_, li_value))) in wp.iter().zip(li.iter()).enumerate() {
                stmt.execute(params![
                    set_id,
                    index as i64,
                    state.inning as i64,
                    state.half,
                    state.bases,
                    state.outs,
                    state.run_diff,
                    wp_value,
                    li_value,
                ])?;
                rows += 1;
            }
        }
        tx.commit()?;
        info!(version, set_id, game_states = rows, "Artifact set published");
        Ok(set_id)
    }

    pub fn get_set(&self, version: &str) -> Result<Option<ArtifactSetRecord>> {
        let conn = self.lock()?;
        let set = conn
            .query_row(
                "SELECT id, version, created_at, regulation_innings, max_run_diff,
                        home_extra_inning_win_rate, extra_inning_runner_on_second, leverage_scale
                 FROM artifact_sets WHERE version = ?1",
                params![version],
                map_artifact_set,
            )
            .optional()?;
        Ok(set)
    }

    /// All published sets, newest first
    pub fn list_sets(&self) -> Result<Vec<ArtifactSetRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, version, created_at, regulation_innings, max_run_diff,
                    home_extra_inning_win_rate, extra_inning_runner_on_second, leverage_scale
             FROM artifact_sets ORDER BY created_at DESC, id DESC",
        )?;
        let sets = stmt
            .query_map([], map_artifact_set)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sets)
    }

    /// Rebuild the WP and LI tables of a published set.
    pub fn load_tables(&self, version: &str) -> Result<(WinProbabilityTable, LeverageIndexTable)> {
        let set = self
            .get_set(version)?
            .with_context(|| format!("artifact set {version} not found"))?;
        let set_id = set.id.context("artifact set row without id")?;

        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT wp, li FROM game_states WHERE set_id = ?1 ORDER BY state_index")?;
        let (wp, li): (Vec<f64>, Vec<f64>) = stmt
            .query_map(params![set_id], |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        let rules = set.rules();
        let wp = WinProbabilityTable::from_values(rules, wp)
            .with_context(|| format!("artifact set {version} has a corrupt WP table"))?;
        let li = LeverageIndexTable::from_values(rules, set.leverage_scale, li)
            .with_context(|| format!("artifact set {version} has a corrupt LI table"))?;
        Ok((wp, li))
    }

    // ── Play evaluations ─────────────────────────────────────────────────────

    /// Store evaluations against a published set; re-evaluating a play
    /// replaces its previous row.
    pub fn record_evaluations(&self, version: &str, records: &[PlayEvaluationRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let set_id: i64 = tx
            .query_row(
                "SELECT id FROM artifact_sets WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("artifact set {version} not found"))?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO play_evaluations (
                    set_id, play_id, inning, half, bases, outs, run_diff,
                    wp, xwp, next_wp, li, wpa, xwpa, wpoe, wpa_li, wpoe_li, out_over_expected,
                    evaluated_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            )?;
            for r in records {
                stmt.execute(params![
                    set_id,
                    r.play_id,
                    r.inning,
                    r.half,
                    r.bases,
                    r.outs,
                    r.run_diff,
                    r.wp,
                    r.xwp,
                    r.next_wp,
                    r.li,
                    r.wpa,
                    r.xwpa,
                    r.wpoe,
                    r.wpa_li,
                    r.wpoe_li,
                    r.out_over_expected,
                    r.evaluated_at,
                ])?;
            }
        }
        tx.commit()?;
        info!(version, plays = records.len(), "Play evaluations recorded");
        Ok(records.len())
    }

    pub fn list_evaluations(&self, version: &str, limit: i64) -> Result<Vec<PlayEvaluationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.play_id, e.inning, e.half, e.bases, e.outs, e.run_diff,
                    e.wp, e.xwp, e.next_wp, e.li, e.wpa, e.xwpa, e.wpoe, e.wpa_li, e.wpoe_li,
                    e.out_over_expected, e.evaluated_at
             FROM play_evaluations e JOIN artifact_sets s ON s.id = e.set_id
             WHERE s.version = ?1 ORDER BY e.id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![version, limit], map_play_evaluation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_artifact_set(row: &rusqlite::Row) -> rusqlite::Result<ArtifactSetRecord> {
    Ok(ArtifactSetRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        created_at: row.get(2)?,
        regulation_innings: row.get(3)?,
        max_run_diff: row.get(4)?,
        home_extra_inning_win_rate: row.get(5)?,
        extra_inning_runner_on_second: row.get(6)?,
        leverage_scale: row.get(7)?,
    })
}

fn map_play_evaluation(row: &rusqlite::Row) -> rusqlite::Result<PlayEvaluationRecord> {
    Ok(PlayEvaluationRecord {
        id: row.get(0)?,
        play_id: row.get(1)?,
        inning: row.get(2)?,
        half: row.get(3)?,
        bases: row.get(4)?,
        outs: row.get(5)?,
        run_diff: row.get(6)?,
        wp: row.get(7)?,
        xwp: row.get(8)?,
        next_wp: row.get(9)?,
        li: row.get(10)?,
        wpa: row.get(11)?,
        xwpa: row.get(12)?,
        wpoe: row.get(13)?,
        wpa_li: row.get(14)?,
        wpoe_li: row.get(15)?,
        out_over_expected: row.get(16)?,
        evaluated_at: row.get(17)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS artifact_sets (
    id                              INTEGER PRIMARY KEY AUTOINCREMENT,
    version                         TEXT    NOT NULL UNIQUE,
    created_at                      TEXT    NOT NULL,
    regulation_innings              INTEGER NOT NULL,
    max_run_diff                    INTEGER NOT NULL,
    home_extra_inning_win_rate      REAL    NOT NULL,
    extra_inning_runner_on_second   INTEGER NOT NULL,
    leverage_scale                  REAL    NOT NULL
);

CREATE TABLE IF NOT EXISTS game_states (
    set_id      INTEGER NOT NULL REFERENCES artifact_sets(id),
    state_index INTEGER NOT NULL,
    inning      INTEGER NOT NULL,
    half        TEXT    NOT NULL,
    bases       INTEGER NOT NULL,
    outs        INTEGER NOT NULL,
    run_diff    INTEGER NOT NULL,
    wp          REAL    NOT NULL,
    li          REAL    NOT NULL,
    PRIMARY KEY (set_id, state_index)
);

CREATE TABLE IF NOT EXISTS play_evaluations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    set_id       INTEGER NOT NULL REFERENCES artifact_sets(id),
    play_id      TEXT    NOT NULL,
    inning       INTEGER NOT NULL,
    half         TEXT    NOT NULL,
    bases        INTEGER NOT NULL,
    outs         INTEGER NOT NULL,
    run_diff     INTEGER NOT NULL,
    wp           REAL    NOT NULL,
    xwp          REAL    NOT NULL,
    next_wp      REAL,
    li           REAL,
    wpa          REAL,
    xwpa         REAL,
    wpoe         REAL,
    wpa_li       REAL,
    wpoe_li      REAL,
    out_over_expected REAL,
    evaluated_at TEXT    NOT NULL,
    UNIQUE (set_id, play_id)
);

CREATE INDEX IF NOT EXISTS idx_game_states_lookup
    ON game_states(set_id, inning, half, bases, outs, run_diff);
CREATE INDEX IF NOT EXISTS idx_play_evaluations_set ON play_evaluations(set_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::base_out::BaseState;
    use crate::model::game_state::{GameRules, GameState, Half};
    use crate::model::leverage::build_leverage_index;
    use crate::model::run_distribution::tests::synthetic_table;
    use crate::model::run_distribution::{RunDistributions, RunRegime};
    use crate::model::transition_matrix::tests::league_tensor;
    use crate::model::win_probability::solve;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wp.db");
        let store = ArtifactStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn tables() -> (WinProbabilityTable, LeverageIndexTable) {
        let rules = GameRules::default();
        let runs = RunDistributions {
            normal: synthetic_table(RunRegime::Normal, 0.0),
            need_one_run: synthetic_table(RunRegime::NeedOneRun, 0.1),
        };
        let wp = solve(&runs, &rules, 1e-6).unwrap();
        let reference = vec![
            GameState::new(&rules, 2, Half::Top, BaseState::EMPTY, 1, 0).unwrap(),
            GameState::new(&rules, 8, Half::Bottom, BaseState::new(0b011).unwrap(), 1, -1).unwrap(),
        ];
        let li = build_leverage_index(&wp, &league_tensor(), &reference).unwrap();
        (wp, li)
    }

    fn evaluation(play_id: &str, xwp: f64) -> PlayEvaluationRecord {
        PlayEvaluationRecord {
            id: None,
            play_id: play_id.into(),
            inning: 6,
            half: Half::Bottom,
            bases: BaseState::new(0b101).unwrap(),
            outs: 1,
            run_diff: -2,
            wp: 0.21,
            xwp,
            next_wp: None,
            li: Some(1.4),
            wpa: None,
            xwpa: Some(0.03),
            wpoe: None,
            wpa_li: None,
            wpoe_li: None,
            out_over_expected: Some(-0.4),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn published_tables_load_back() {
        let (_dir, store) = open_store();
        let (wp, li) = tables();
        store.publish("2024-v1", &wp, &li).unwrap();

        let (wp_back, li_back) = store.load_tables("2024-v1").unwrap();
        assert_eq!(wp_back.rules(), wp.rules());
        assert_eq!(wp_back.values().len(), wp.values().len());
        let s = GameState::new(wp.rules(), 8, Half::Bottom, BaseState::LOADED, 2, -1).unwrap();
        assert_relative_eq!(wp_back.get(&s).unwrap(), wp.get(&s).unwrap());
        assert_relative_eq!(li_back.get(&s).unwrap(), li.get(&s).unwrap());
        assert_relative_eq!(li_back.scale(), li.scale());

        let sets = store.list_sets().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].rules(), *wp.rules());
    }

    #[test]
    fn republishing_a_version_is_rejected() {
        let (_dir, store) = open_store();
        let (wp, li) = tables();
        store.publish("v1", &wp, &li).unwrap();
        assert!(store.publish("v1", &wp, &li).is_err());
        assert_eq!(store.list_sets().unwrap().len(), 1);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let (_dir, store) = open_store();
        assert!(store.get_set("nope").unwrap().is_none());
        assert!(store.load_tables("nope").is_err());
        assert!(store.record_evaluations("nope", &[evaluation("p1", 0.2)]).is_err());
    }

    #[test]
    fn evaluations_are_stored_per_set_and_replaced_on_rerun() {
        let (_dir, store) = open_store();
        let (wp, li) = tables();
        store.publish("v1", &wp, &li).unwrap();

        store
            .record_evaluations("v1", &[evaluation("p1", 0.2), evaluation("p2", 0.3)])
            .unwrap();
        store.record_evaluations("v1", &[evaluation("p1", 0.25)]).unwrap();

        let rows = store.list_evaluations("v1", 10).unwrap();
        assert_eq!(rows.len(), 2);
        let p1 = rows.iter().find(|r| r.play_id == "p1").unwrap();
        assert_relative_eq!(p1.xwp, 0.25);
        assert_eq!(p1.half, Half::Bottom);
        assert_eq!(p1.bases, BaseState::new(0b101).unwrap());
        assert_eq!(p1.next_wp, None);
        assert_eq!(p1.out_over_expected, Some(-0.4));
    }
}
