use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{ComputeClient, ComputeError, ComputeResult};
use crate::rule::Rule;

/// On-disk state of one project.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Filesystem-backed compute client.
///
/// Layout: `<root>/<project>.json`, each holding a [`ProjectFile`]. A missing
/// file means the project does not exist. Writes are atomic (temp file in the
/// same directory, then rename).
pub struct JsonDirComputeClient {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirComputeClient {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("state directory {} does not exist", root.display()),
            ));
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn project_path(&self, project: &str) -> ComputeResult<PathBuf> {
        if project.is_empty() || project.contains(['/', '\\']) || project.starts_with('.') {
            return Err(ComputeError::NotFound {
                resource: format!("project {project:?}"),
            });
        }
        Ok(self.root.join(format!("{project}.json")))
    }

    fn load(&self, project: &str) -> ComputeResult<ProjectFile> {
        let path = self.project_path(project)?;
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ComputeError::NotFound {
                    resource: format!("project {project}"),
                }
            } else {
                ComputeError::Transport(format!("reading {}: {e}", path.display()))
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ComputeError::Transport(format!("malformed state file {}: {e}", path.display()))
        })
    }

    fn store(&self, project: &str, state: &ProjectFile) -> ComputeResult<()> {
        let path = self.project_path(project)?;
        let transport = |e: std::io::Error| {
            ComputeError::Transport(format!("writing {}: {e}", path.display()))
        };
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| ComputeError::Transport(format!("encoding project {project}: {e}")))?;

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(transport)?;
        tmp.write_all(&data).map_err(transport)?;
        tmp.persist(&path).map_err(|e| transport(e.error))?;
        Ok(())
    }

    /// Load, edit and write back the rules of `project` under the write lock.
    fn edit_rules(
        &self,
        project: &str,
        edit: impl FnOnce(&mut BTreeMap<String, Rule>) -> ComputeResult<()>,
    ) -> ComputeResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ComputeError::Transport("state lock poisoned".to_string()))?;

        let mut state = self.load(project)?;
        let mut rules: BTreeMap<String, Rule> = state
            .rules
            .drain(..)
            .map(|r| (r.name.clone(), r))
            .collect();
        edit(&mut rules)?;
        state.rules = rules.into_values().collect();
        self.store(project, &state)
    }
}

fn rule_not_found(name: &str) -> ComputeError {
    ComputeError::NotFound {
        resource: format!("firewall rule {name}"),
    }
}

#[async_trait]
impl ComputeClient for JsonDirComputeClient {
    async fn list_firewall_rules(&self, project: &str) -> ComputeResult<Vec<Rule>> {
        Ok(self.load(project)?.rules)
    }

    async fn insert_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
        self.edit_rules(project, |rules| {
            if rules.contains_key(&rule.name) {
                return Err(ComputeError::Api {
                    status: 409,
                    message: format!("firewall rule {} already exists", rule.name),
                });
            }
            rules.insert(rule.name.clone(), rule.clone());
            Ok(())
        })
    }

    async fn delete_firewall_rule(&self, project: &str, rule_name: &str) -> ComputeResult<()> {
        self.edit_rules(project, |rules| {
            rules
                .remove(rule_name)
                .map(|_| ())
                .ok_or_else(|| rule_not_found(rule_name))
        })
    }

    async fn update_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
        self.edit_rules(project, |rules| {
            let slot = rules
                .get_mut(&rule.name)
                .ok_or_else(|| rule_not_found(&rule.name))?;
            *slot = rule.clone();
            Ok(())
        })
    }

    async fn list_networks(&self, project: &str) -> ComputeResult<Vec<String>> {
        Ok(self.load(project)?.networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client() -> (tempfile::TempDir, JsonDirComputeClient) {
        let dir = tempfile::tempdir().unwrap();
        let client = JsonDirComputeClient::new(dir.path()).unwrap();
        (dir, client)
    }

    fn write_project(dir: &Path, project: &str, file: &ProjectFile) {
        fs::write(
            dir.join(format!("{project}.json")),
            serde_json::to_vec(file).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn lists_rules_and_networks_from_file() {
        let (dir, client) = make_client();
        write_project(
            dir.path(),
            "proj-a",
            &ProjectFile {
                networks: vec!["default".to_string()],
                rules: vec![Rule::new("allow-ssh").allow("tcp", ["22"])],
            },
        );

        let rules = client.list_firewall_rules("proj-a").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            client.list_networks("proj-a").await.unwrap(),
            vec!["default".to_string()]
        );
    }

    #[tokio::test]
    async fn mutations_persist_to_disk() {
        let (dir, client) = make_client();
        write_project(dir.path(), "proj-a", &ProjectFile::default());

        client
            .insert_firewall_rule("proj-a", &Rule::new("allow-web"))
            .await
            .unwrap();
        client
            .update_firewall_rule("proj-a", &Rule::new("allow-web").with_priority(5))
            .await
            .unwrap();

        let reopened = JsonDirComputeClient::new(dir.path()).unwrap();
        let rules = reopened.list_firewall_rules("proj-a").await.unwrap();
        assert_eq!(rules, vec![Rule::new("allow-web").with_priority(5)]);

        client
            .delete_firewall_rule("proj-a", "allow-web")
            .await
            .unwrap();
        assert!(reopened
            .list_firewall_rules("proj-a")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let (_dir, client) = make_client();
        let err = client.list_firewall_rules("nope").await.unwrap_err();
        assert!(matches!(err, ComputeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn path_like_project_ids_are_rejected() {
        let (_dir, client) = make_client();
        for project in ["../etc", "a/b", ""] {
            assert!(client.list_firewall_rules(project).await.is_err());
        }
    }

    #[tokio::test]
    async fn malformed_file_is_a_transport_error() {
        let (dir, client) = make_client();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let err = client.list_firewall_rules("broken").await.unwrap_err();
        assert!(matches!(err, ComputeError::Transport(_)));
    }

    #[test]
    fn missing_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JsonDirComputeClient::new(dir.path().join("absent")).is_err());
    }
}
