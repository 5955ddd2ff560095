//! Project directory layout, creation and `meta.json` persistence.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::pipeline::PROJECT_SUBDIRS;
use crate::core::types::ProjectMeta;

const META_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/meta.v1.schema.json"
));

static META_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(META_SCHEMA).map_err(|err| format!("parse meta schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid schema: {err}"))
});

const CREATE_ATTEMPTS: u32 = 5;

/// Well-known paths inside one project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub meta_path: PathBuf,
    pub idea_dir: PathBuf,
    pub plan_dir: PathBuf,
    pub exp_dir: PathBuf,
    pub results_dir: PathBuf,
    pub paper_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub script_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let exp_dir = root.join("02_exp");
        Self {
            root: root.to_path_buf(),
            meta_path: root.join("meta.json"),
            idea_dir: root.join("00_idea"),
            plan_dir: root.join("01_plan"),
            runs_dir: exp_dir.join("runs"),
            script_path: exp_dir.join("run.sbatch"),
            exp_dir,
            results_dir: root.join("03_results"),
            paper_dir: root.join("04_paper"),
        }
    }

    pub fn idea_file(&self) -> PathBuf {
        self.idea_dir.join("idea.json")
    }

    pub fn plan_config(&self) -> PathBuf {
        self.plan_dir.join("config.yaml")
    }

    pub fn paper_file(&self) -> PathBuf {
        self.paper_dir.join("paper.md")
    }

    pub fn reproducibility_file(&self) -> PathBuf {
        self.paper_dir.join("reproducibility.md")
    }

    /// Directory for the 1-based run `index` (`run_0001`, ...).
    pub fn run_dir(&self, index: usize) -> PathBuf {
        self.runs_dir.join(format!("run_{index:04}"))
    }
}

/// A freshly created project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub project_id: String,
    pub project_dir: PathBuf,
    pub meta: ProjectMeta,
}

/// Creates project directories for the daemon.
pub trait ProjectFactory {
    fn create_project(&self, root: &Path) -> Result<NewProject>;
}

/// Default factory: time-derived ids, standard subdirectories, initial snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct Workspace;

impl ProjectFactory for Workspace {
    fn create_project(&self, root: &Path) -> Result<NewProject> {
        fs::create_dir_all(root)
            .with_context(|| format!("create project root {}", root.display()))?;

        for attempt in 0..CREATE_ATTEMPTS {
            let now = Utc::now();
            let project_id = project_id_at(now);
            let project_dir = root.join(&project_id);
            match fs::create_dir(&project_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    warn!(project_id, attempt, "project id collision, retrying");
                    thread::sleep(Duration::from_millis(2));
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create project dir {}", project_dir.display()));
                }
            }

            for sub in PROJECT_SUBDIRS {
                let dir = project_dir.join(sub);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("create {}", dir.display()))?;
            }
            let meta = ProjectMeta::new(project_id.clone(), now);
            write_meta(&ProjectPaths::new(&project_dir).meta_path, &meta)?;
            info!(project_id, dir = %project_dir.display(), "project created");
            return Ok(NewProject {
                project_id,
                project_dir,
                meta,
            });
        }
        bail!("could not allocate a unique project id under {}", root.display())
    }
}

/// `P<YYYYMMDD>_<HHMMSS>_<millis>` in UTC.
pub fn project_id_at(now: DateTime<Utc>) -> String {
    now.format("P%Y%m%d_%H%M%S_%3f").to_string()
}

/// Load `meta.json`, validating it against the embedded snapshot schema.
pub fn load_meta(path: &Path) -> Result<ProjectMeta> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read meta {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse meta {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate meta {}", path.display()))?;
    let meta: ProjectMeta = serde_json::from_value(value)
        .with_context(|| format!("deserialize meta {}", path.display()))?;
    Ok(meta)
}

/// Atomically replace `meta.json`.
pub fn write_meta(path: &Path, meta: &ProjectMeta) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize meta")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_schema(meta: &Value) -> Result<()> {
    let compiled = META_VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))?;
    if !compiled.is_valid(meta) {
        let messages = compiled
            .iter_errors(meta)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "meta schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Snapshot helper for callers that only know a project directory.
pub fn load_project_meta(project_dir: &Path) -> Result<ProjectMeta> {
    load_meta(&ProjectPaths::new(project_dir).meta_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProjectState;
    use chrono::TimeZone;

    #[test]
    fn project_id_is_time_derived() {
        let now = Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("valid time")
            + chrono::Duration::milliseconds(42);
        assert_eq!(project_id_at(now), "P20240309_140507_042");
    }

    #[test]
    fn create_project_lays_out_directory_and_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let created = Workspace.create_project(temp.path()).expect("create");

        assert_eq!(created.project_dir, temp.path().join(&created.project_id));
        for sub in PROJECT_SUBDIRS {
            assert!(created.project_dir.join(sub).is_dir(), "{sub}");
        }
        let loaded = load_project_meta(&created.project_dir).expect("load");
        assert_eq!(loaded, created.meta);
        assert_eq!(loaded.state, ProjectState::Idea);
        assert_eq!(loaded.retry_count, 0);
        assert_eq!(loaded.budget.tokens, 200_000);
        assert_eq!(loaded.budget.wall_minutes, 90);
    }

    #[test]
    fn back_to_back_projects_get_distinct_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = Workspace.create_project(temp.path()).expect("create");
        let second = Workspace.create_project(temp.path()).expect("create");
        assert_ne!(first.project_id, second.project_id);
    }

    #[test]
    fn load_meta_rejects_unknown_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("meta.json");
        fs::write(
            &path,
            r#"{"project_id":"P1","state":"SLEEPING","created_at":"2024-01-01T00:00:00Z",
               "updated_at":"2024-01-01T00:00:00Z","retry_count":0}"#,
        )
        .expect("write");

        let err = load_meta(&path).expect_err("invalid state");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn schema_validator_is_compiled_once_and_reused() {
        let first = META_VALIDATOR.as_ref().expect("embedded schema compiles");
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("meta.json");
        write_meta(&path, &ProjectMeta::new("P1", Utc::now())).expect("write");
        load_meta(&path).expect("load");
        load_meta(&path).expect("load again");
        let second = META_VALIDATOR.as_ref().expect("embedded schema compiles");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn write_meta_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("meta.json");
        write_meta(&path, &ProjectMeta::new("P1", Utc::now())).expect("write");
        assert!(path.exists());
        assert!(!temp.path().join("meta.json.tmp").exists());
    }
}
