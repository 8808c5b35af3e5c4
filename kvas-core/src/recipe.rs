//! Command sequences a task runs on its machines.

use serde::Deserialize;

use crate::shell::quote;
use crate::topology::NODE_CONTAINER;

fn default_client_image() -> String {
    "ghcr.io/kvas/loadtest-client:latest".to_string()
}

fn default_kv_port() -> u16 {
    8080
}

fn default_load_test_args() -> String {
    String::new()
}

/// Images, ports and setup steps shared by every task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Recipe {
    /// Image of the load-generating client.
    #[serde(default = "default_client_image")]
    pub client_image: String,

    /// Port every key-value node serves on.
    #[serde(default = "default_kv_port")]
    pub kv_port: u16,

    /// Registry host to authenticate docker against before pulling.
    #[serde(default)]
    pub registry: Option<String>,

    /// Extra arguments appended to the load-test invocation.
    #[serde(default = "default_load_test_args")]
    pub load_test_args: String,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            client_image: default_client_image(),
            kv_port: default_kv_port(),
            registry: None,
            load_test_args: default_load_test_args(),
        }
    }
}

impl Recipe {
    /// Commands preparing a node to run `image`.
    pub fn node_setup(&self, image: &str) -> Vec<String> {
        self.pull(image)
    }

    /// Commands preparing the client machine.
    pub fn client_setup(&self) -> Vec<String> {
        self.pull(&self.client_image)
    }

    /// Load-test invocation against the leader.
    pub fn load_test(&self, leader_address: &str) -> String {
        let mut cmd = format!(
            "docker run --rm --network host {} --target {}",
            quote(&self.client_image),
            quote(&format!("{}:{}", leader_address, self.kv_port))
        );
        if !self.load_test_args.trim().is_empty() {
            cmd.push(' ');
            cmd.push_str(self.load_test_args.trim());
        }
        cmd
    }

    /// Command dumping a node's logs.
    pub fn node_logs(&self) -> String {
        format!("docker logs {}", NODE_CONTAINER)
    }

    fn pull(&self, image: &str) -> Vec<String> {
        let mut steps = Vec::with_capacity(2);
        if let Some(registry) = &self.registry {
            steps.push(format!(
                "gcloud auth configure-docker {} --quiet",
                quote(registry)
            ));
        }
        steps.push(format!("docker pull {}", quote(image)));
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_table() {
        let recipe: Recipe = toml::from_str("").unwrap();
        assert_eq!(recipe, Recipe::default());
        assert_eq!(recipe.kv_port, 8080);
    }

    #[test]
    fn node_setup_without_registry_is_a_pull() {
        let recipe = Recipe::default();
        assert_eq!(recipe.node_setup("kv:1"), vec!["docker pull kv:1".to_string()]);
    }

    #[test]
    fn registry_login_comes_first() {
        let recipe: Recipe = toml::from_str(
            r#"
            client_image = "client:2"
            registry = "europe-docker.pkg.dev"
            "#,
        )
        .unwrap();
        assert_eq!(
            recipe.client_setup(),
            vec![
                "gcloud auth configure-docker europe-docker.pkg.dev --quiet".to_string(),
                "docker pull client:2".to_string(),
            ]
        );
    }

    #[test]
    fn load_test_targets_leader() {
        let mut recipe = Recipe {
            client_image: "client:2".into(),
            ..Recipe::default()
        };
        assert_eq!(
            recipe.load_test("10.0.0.5"),
            "docker run --rm --network host client:2 --target 10.0.0.5:8080"
        );
        recipe.load_test_args = " --duration 60s ".into();
        assert!(recipe.load_test("10.0.0.5").ends_with("10.0.0.5:8080 --duration 60s"));
    }

    #[test]
    fn logs_read_node_container() {
        assert_eq!(Recipe::default().node_logs(), "docker logs kvnode");
    }
}
