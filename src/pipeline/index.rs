//! Read-only lookup from step name to step.

use std::collections::HashMap;

use super::step::Step;

/// Name index over a pipeline's steps, built once per run.
#[derive(Debug, Clone)]
pub struct StepIndex<'a> {
    by_name: HashMap<&'a str, &'a Step>,
}

impl<'a> StepIndex<'a> {
    pub fn new(steps: &'a [Step]) -> Self {
        Self {
            by_name: steps.iter().map(|s| (s.name.as_str(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&'a Step> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::step::{ShellStep, StepKind};
    use std::path::PathBuf;

    fn shell(name: &str) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Shell(ShellStep {
                command: "true > out.jsonl".to_string(),
                work_dir: PathBuf::from("/tmp"),
            }),
            output_path: PathBuf::from("/tmp/out.jsonl"),
        }
    }

    #[test]
    fn test_lookup() {
        let steps = vec![shell("a"), shell("b")];
        let index = StepIndex::new(&steps);

        assert_eq!(index.len(), 2);
        assert!(index.contains("a"));
        assert_eq!(index.get("b").map(|s| s.name.as_str()), Some("b"));
        assert!(index.get("c").is_none());
        assert!(StepIndex::new(&[]).is_empty());
    }
}
