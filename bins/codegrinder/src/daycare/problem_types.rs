// Problem-type table: (problem type, action) -> image, limits, exec plan.
use anyhow::{bail, Context, Result};
use codegrinder_common::{ActionConfig, ProblemType};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProblemTypesFile {
    problem_types: Vec<ProblemType>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LookupError {
    #[error("unknown problem type {0:?}")]
    UnknownProblemType(String),
    #[error("problem type {problem_type:?} has no action {action:?}")]
    UnknownAction {
        problem_type: String,
        action: String,
    },
}

/// Read-only lookup table, populated once at startup.
#[derive(Debug, Clone)]
pub struct ProblemTypeRegistry {
    types: HashMap<String, ProblemType>,
}

impl ProblemTypeRegistry {
    /// Load the table from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("problem-type config file not found: {}", path.display());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: ProblemTypesFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_types(file.problem_types)
    }

    /// Load from the given path if it exists, otherwise fall back to the
    /// table compiled into the binary.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::builtin()
        }
    }

    /// The problem-type table shipped with the binary.
    pub fn builtin() -> Result<Self> {
        let file: ProblemTypesFile =
            serde_json::from_str(include_str!("../../../../config/problem_types.json"))
                .context("failed to parse built-in problem-type table")?;
        Self::from_types(file.problem_types)
    }

    fn from_types(types: Vec<ProblemType>) -> Result<Self> {
        let mut map = HashMap::new();
        for pt in types {
            for (action, config) in &pt.actions {
                if config.commands.is_empty() {
                    bail!(
                        "problem type {} action {} has no commands configured",
                        pt.name,
                        action
                    );
                }
            }
            if map.insert(pt.name.clone(), pt).is_some() {
                bail!("duplicate problem type in config");
            }
        }
        Ok(ProblemTypeRegistry { types: map })
    }

    pub fn get(&self, problem_type: &str) -> Result<&ProblemType, LookupError> {
        self.types
            .get(problem_type)
            .ok_or_else(|| LookupError::UnknownProblemType(problem_type.to_string()))
    }

    /// Resolve an action: the image comes from the problem type, the limits
    /// and exec plan from the action config.
    pub fn action(
        &self,
        problem_type: &str,
        action: &str,
    ) -> Result<(&ProblemType, &ActionConfig), LookupError> {
        let pt = self.get(problem_type)?;
        let config = pt
            .actions
            .get(action)
            .ok_or_else(|| LookupError::UnknownAction {
                problem_type: problem_type.to_string(),
                action: action.to_string(),
            })?;
        Ok((pt, config))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegrinder_common::ReportParser;

    #[test]
    fn test_builtin_table_loads() {
        let registry = ProblemTypeRegistry::builtin().unwrap();
        assert!(registry.names().contains(&"python3unittest".to_string()));
        assert!(registry.names().contains(&"gounittest".to_string()));
    }

    #[test]
    fn test_action_lookup() {
        let registry = ProblemTypeRegistry::builtin().unwrap();

        let (pt, grade) = registry.action("python3unittest", "grade").unwrap();
        assert_eq!(pt.image, "codegrinder/python");
        assert!(!grade.interactive);
        assert_eq!(grade.parser, ReportParser::Xunit);
        assert!(grade.commands.len() >= 2);

        let (_, run) = registry.action("python3unittest", "run").unwrap();
        assert!(run.interactive);
        assert_eq!(run.parser, ReportParser::None);
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = ProblemTypeRegistry::builtin().unwrap();
        assert_eq!(
            registry.action("cobolunittest", "grade").unwrap_err(),
            LookupError::UnknownProblemType("cobolunittest".to_string())
        );
        assert_eq!(
            registry.action("python3unittest", "deploy").unwrap_err(),
            LookupError::UnknownAction {
                problem_type: "python3unittest".to_string(),
                action: "deploy".to_string(),
            }
        );
    }

    #[test]
    fn test_inout_action_defaults() {
        let registry = ProblemTypeRegistry::builtin().unwrap();
        let (_, grade) = registry.action("rustinout", "grade").unwrap();
        assert_eq!(grade.parser, ReportParser::Inout);
        // unset limits pick up the defaults
        assert_eq!(grade.max_timeout, 60);
        assert_eq!(grade.max_fd, 100);
    }
}
