//! Read-only artifact checks run after a stage, before the state advances.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::core::types::{ActionCatalog, GateVerdict, RunMetrics, RunStatus};
use crate::io::workspace::ProjectPaths;

pub const REQUIRED_PAPER_SECTIONS: [&str; 3] = ["## Results", "## Method", "## Limitations"];

/// `00_idea/idea.json` must list only catalog actions.
pub fn idea_gate(project_dir: &Path, catalog: &ActionCatalog) -> GateVerdict {
    let path = ProjectPaths::new(project_dir).idea_file();
    let Ok(raw) = fs::read_to_string(&path) else {
        return GateVerdict::fail("idea.json not found");
    };
    let idea: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => return GateVerdict::fail(format!("idea.json is not valid JSON: {err}")),
    };
    let Some(actions) = idea.get("actions").and_then(Value::as_array) else {
        return GateVerdict::fail("idea.json has no actions list");
    };
    if actions.is_empty() {
        return GateVerdict::fail("idea.json has no actions");
    }
    for action in actions {
        match action.as_str() {
            Some(id) if catalog.contains(id) => {}
            Some(id) => return GateVerdict::fail(format!("invalid action: {id}")),
            None => return GateVerdict::fail(format!("invalid action: {action}")),
        }
    }
    GateVerdict::pass()
}

/// Every run directory under `02_exp/runs/` must carry a well-formed `metrics.json`.
pub fn experiment_gate(project_dir: &Path) -> GateVerdict {
    let runs_dir = ProjectPaths::new(project_dir).runs_dir;
    let Ok(entries) = fs::read_dir(&runs_dir) else {
        return GateVerdict::fail("runs directory not found");
    };

    let mut run_dirs: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    if run_dirs.is_empty() {
        return GateVerdict::fail("no experiment runs found");
    }
    run_dirs.sort();

    for run_dir in run_dirs {
        let name = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Ok(raw) = fs::read_to_string(run_dir.join("metrics.json")) else {
            return GateVerdict::fail(format!("metrics.json missing in {name}"));
        };
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => return GateVerdict::fail(format!("metrics.json unreadable in {name}")),
        };
        // Check status first so a bad value is reported as such, not as a parse error.
        let status_ok = value
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|s| s == "SUCCESS" || s == "FAIL");
        if !status_ok {
            return GateVerdict::fail(format!("invalid status in {name}"));
        }
        let metrics: RunMetrics = match serde_json::from_value(value) {
            Ok(metrics) => metrics,
            Err(err) => {
                return GateVerdict::fail(format!("metrics.json malformed in {name}: {err}"));
            }
        };
        if metrics.status == RunStatus::Success && metrics.primary_metric.is_none() {
            return GateVerdict::fail(format!("missing primary_metric in {name}"));
        }
    }
    GateVerdict::pass()
}

/// `04_paper/paper.md` needs the required sections; `reproducibility.md` must exist.
pub fn paper_gate(project_dir: &Path) -> GateVerdict {
    let paths = ProjectPaths::new(project_dir);
    let Ok(paper) = fs::read_to_string(paths.paper_file()) else {
        return GateVerdict::fail("paper.md not found");
    };
    let missing: Vec<&str> = REQUIRED_PAPER_SECTIONS
        .iter()
        .copied()
        .filter(|section| !paper.contains(section))
        .collect();
    if !missing.is_empty() {
        return GateVerdict::fail(format!("paper.md missing sections: {}", missing.join(", ")));
    }
    if !paths.reproducibility_file().is_file() {
        return GateVerdict::fail("reproducibility.md not found");
    }
    GateVerdict::pass()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_idea, write_paper, write_run_metrics};

    fn catalog() -> ActionCatalog {
        ActionCatalog::new(["train_baseline", "sweep_lr"])
    }

    #[test]
    fn idea_gate_accepts_catalog_actions() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_idea(temp.path(), &["train_baseline", "sweep_lr"]);
        assert_eq!(idea_gate(temp.path(), &catalog()), GateVerdict::pass());
    }

    #[test]
    fn idea_gate_names_unknown_action() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_idea(temp.path(), &["train_baseline", "teleport"]);
        let verdict = idea_gate(temp.path(), &catalog());
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "invalid action: teleport");
    }

    #[test]
    fn idea_gate_rejects_missing_empty_and_malformed() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            idea_gate(temp.path(), &catalog()).reason,
            "idea.json not found"
        );

        write_idea(temp.path(), &[]);
        assert!(!idea_gate(temp.path(), &catalog()).passed);

        let idea_path = ProjectPaths::new(temp.path()).idea_file();
        fs::write(&idea_path, r#"{"actions": [3]}"#).expect("write");
        assert_eq!(idea_gate(temp.path(), &catalog()).reason, "invalid action: 3");

        fs::write(&idea_path, "not json").expect("write");
        assert!(!idea_gate(temp.path(), &catalog()).passed);
    }

    #[test]
    fn experiment_gate_passes_success_and_fail_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_run_metrics(temp.path(), "run_0001", "SUCCESS", Some(0.9));
        write_run_metrics(temp.path(), "run_0002", "FAIL", None);
        assert!(experiment_gate(temp.path()).passed);
    }

    #[test]
    fn experiment_gate_requires_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!experiment_gate(temp.path()).passed);

        let runs_dir = ProjectPaths::new(temp.path()).runs_dir;
        fs::create_dir_all(&runs_dir).expect("mkdir");
        fs::write(runs_dir.join("notes.txt"), "stray file").expect("write");
        assert_eq!(experiment_gate(temp.path()).reason, "no experiment runs found");
    }

    #[test]
    fn experiment_gate_names_the_offending_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_run_metrics(temp.path(), "run_0002", "SUCCESS", Some(0.5));
        fs::create_dir_all(ProjectPaths::new(temp.path()).run_dir(1)).expect("mkdir");
        assert_eq!(
            experiment_gate(temp.path()).reason,
            "metrics.json missing in run_0001"
        );
    }

    #[test]
    fn experiment_gate_checks_status_and_primary_metric() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_run_metrics(temp.path(), "run_0001", "SUCCESS", None);
        assert_eq!(
            experiment_gate(temp.path()).reason,
            "missing primary_metric in run_0001"
        );

        let other = tempfile::tempdir().expect("tempdir");
        write_run_metrics(other.path(), "run_0001", "MAYBE", Some(1.0));
        assert_eq!(
            experiment_gate(other.path()).reason,
            "invalid status in run_0001"
        );
    }

    #[test]
    fn paper_gate_lists_missing_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(paper_gate(temp.path()).reason, "paper.md not found");

        let paths = ProjectPaths::new(temp.path());
        fs::create_dir_all(&paths.paper_dir).expect("mkdir");
        fs::write(paths.paper_file(), "# Title\n\n## Method\n").expect("write");
        assert_eq!(
            paper_gate(temp.path()).reason,
            "paper.md missing sections: ## Results, ## Limitations"
        );
    }

    #[test]
    fn paper_gate_requires_reproducibility_notes() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_paper(temp.path(), false);
        assert_eq!(paper_gate(temp.path()).reason, "reproducibility.md not found");

        write_paper(temp.path(), true);
        assert!(paper_gate(temp.path()).passed);
    }
}
