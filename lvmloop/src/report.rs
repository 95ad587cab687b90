//! What a run did, step by step.

use crate::errors::Stage;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Reused,
    Removed,
    /// Not present (teardown/status)
    Absent,
    /// Present on the host (status)
    Present,
    /// Would be created or removed (dry run)
    Planned,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Created => "created",
            Outcome::Reused => "reused",
            Outcome::Removed => "removed",
            Outcome::Absent => "absent",
            Outcome::Present => "present",
            Outcome::Planned => "planned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub stage: Stage,
    pub resource: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub dry_run: bool,
    pub steps: Vec<StepReport>,
}

impl ProvisionReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: Stage, resource: impl fmt::Display, outcome: Outcome) {
        self.steps.push(StepReport {
            stage,
            resource: resource.to_string(),
            outcome,
            detail: None,
        });
    }

    pub fn push_detail(
        &mut self,
        stage: Stage,
        resource: impl fmt::Display,
        outcome: Outcome,
        detail: impl Into<String>,
    ) {
        self.steps.push(StepReport {
            stage,
            resource: resource.to_string(),
            outcome,
            detail: Some(detail.into()),
        });
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = StepReport>) {
        self.steps.extend(steps);
    }

    /// True if any step changed (or would change, in a dry run) the host.
    pub fn changed(&self) -> bool {
        self.steps.iter().any(|step| {
            matches!(
                step.outcome,
                Outcome::Created | Outcome::Removed | Outcome::Planned
            )
        })
    }

    pub fn outcome_of(&self, stage: Stage) -> Option<Outcome> {
        self.steps
            .iter()
            .rev()
            .find(|step| step.stage == stage)
            .map(|step| step.outcome)
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            writeln!(f, "DRY RUN: no changes were made")?;
        }
        let width = self
            .steps
            .iter()
            .map(|step| step.stage.to_string().len())
            .max()
            .unwrap_or(0);
        for step in &self.steps {
            write!(
                f,
                "{:<width$}  {:<8} {}",
                step.stage.to_string(),
                step.outcome.to_string(),
                step.resource
            )?;
            if let Some(detail) = &step.detail {
                write!(f, " ({detail})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_only_runs_are_unchanged() {
        let mut report = ProvisionReport::new(false);
        report.push(Stage::Allocate, "/tmp/disk.img", Outcome::Reused);
        report.push(Stage::Mount, "/mnt/data", Outcome::Reused);
        assert!(!report.changed());

        report.push(Stage::Format, "/dev/vg/lv", Outcome::Created);
        assert!(report.changed());
        assert_eq!(report.outcome_of(Stage::Format), Some(Outcome::Created));
        assert_eq!(report.outcome_of(Stage::Teardown), None);
    }

    #[test]
    fn text_rendering_aligns_columns() {
        let mut report = ProvisionReport::new(true);
        report.push(Stage::Mount, "/mnt/data", Outcome::Planned);
        report.push_detail(
            Stage::PhysicalVolume,
            "/dev/loop0",
            Outcome::Reused,
            "vg_data",
        );
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "DRY RUN: no changes were made");
        assert_eq!(lines[1], "mount            planned  /mnt/data");
        assert_eq!(lines[2], "physical-volume  reused   /dev/loop0 (vg_data)");
    }

    #[test]
    fn json_uses_snake_case_outcomes() {
        let mut report = ProvisionReport::new(false);
        report.push(Stage::LogicalVolume, "vg_data/lv_storage", Outcome::Created);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["stage"], "logical-volume");
        assert_eq!(json["steps"][0]["outcome"], "created");
        assert!(json["steps"][0].get("detail").is_none());
    }
}
