// Detection of AI coding CLIs installed on this machine: whether the binary
// exists, where its config lives, and whether that config already points at a
// local proxy. Rewriting client configs is deliberately not done here.

use std::path::{Path, PathBuf};

use crate::error::AppResult;
use crate::models::AgentConfig;
use crate::store::Store;

struct KnownAgent {
    name: &'static str,
    binaries: &'static [&'static str],
    config_segments: &'static [&'static [&'static str]],
}

const KNOWN_AGENTS: &[KnownAgent] = &[
    KnownAgent {
        name: "claude-code",
        binaries: &["claude"],
        config_segments: &[&[".claude", "settings.json"], &[".claude.json"]],
    },
    KnownAgent {
        name: "codex",
        binaries: &["codex"],
        config_segments: &[&[".codex", "config.toml"], &[".codex", "config.json"]],
    },
    KnownAgent {
        name: "gemini-cli",
        binaries: &["gemini"],
        // Environment-configured; no config file to inspect.
        config_segments: &[],
    },
    KnownAgent {
        name: "amp-cli",
        binaries: &["amp"],
        config_segments: &[&[".config", "amp", "settings.json"]],
    },
    KnownAgent {
        name: "opencode",
        binaries: &["opencode", "oc"],
        config_segments: &[
            &[".config", "opencode", "config.json"],
            &[".opencode", "config.json"],
        ],
    },
    KnownAgent {
        name: "droid",
        binaries: &["droid", "factory-droid", "fd"],
        config_segments: &[&[".factory", "config.json"]],
    },
];

const COMMON_BINARY_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/bin",
    ".local/bin",
    ".cargo/bin",
    ".bun/bin",
    ".deno/bin",
    ".npm-global/bin",
    ".volta/bin",
    ".opencode/bin",
];

fn binary_installed(binaries: &[&str]) -> bool {
    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    let home = dirs::home_dir();

    for binary in binaries {
        for dir in &path_dirs {
            if dir.join(binary).is_file() {
                return true;
            }
        }
        for dir in COMMON_BINARY_DIRS {
            let candidate = if dir.starts_with('/') {
                PathBuf::from(dir).join(binary)
            } else if let Some(home) = &home {
                home.join(dir).join(binary)
            } else {
                continue;
            };
            if candidate.is_file() {
                return true;
            }
        }
    }
    false
}

// A config already pointing at a loopback endpoint counts as configured.
fn config_points_at_proxy(content: &str) -> bool {
    content.contains("localhost:") || content.contains("127.0.0.1:")
}

fn first_existing_config(agent: &KnownAgent) -> (String, Option<PathBuf>) {
    let Some(home) = dirs::home_dir() else {
        return (String::new(), None);
    };
    let mut first_candidate = String::new();
    for segments in agent.config_segments {
        let mut path = home.clone();
        for segment in *segments {
            path.push(segment);
        }
        if first_candidate.is_empty() {
            first_candidate = path.display().to_string();
        }
        if path.exists() {
            return (path.display().to_string(), Some(path));
        }
    }
    (first_candidate, None)
}

pub fn detect(proxy_url: &str) -> Vec<AgentConfig> {
    KNOWN_AGENTS
        .iter()
        .map(|agent| {
            let installed = binary_installed(agent.binaries);
            let (config_path, existing) = first_existing_config(agent);
            let configured = existing
                .as_deref()
                .and_then(|path: &Path| std::fs::read_to_string(path).ok())
                .map(|content| config_points_at_proxy(&content))
                .unwrap_or(false);
            AgentConfig {
                agent_name: agent.name.to_string(),
                config_path,
                installed,
                auto_configured: configured,
                proxy_url: if configured {
                    proxy_url.to_string()
                } else {
                    String::new()
                },
                last_configured: None,
            }
        })
        .collect()
}

// Detect and write the results through to the agent_config table.
pub fn refresh(store: &Store, proxy_url: &str) -> AppResult<Vec<AgentConfig>> {
    let agents = detect(proxy_url);
    for agent in &agents {
        store.upsert_agent(agent)?;
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_markers_in_config_content() {
        assert!(config_points_at_proxy(
            r#"{"env":{"ANTHROPIC_BASE_URL":"http://localhost:8081"}}"#
        ));
        assert!(config_points_at_proxy("base_url = \"http://127.0.0.1:8081\""));
        assert!(!config_points_at_proxy(
            r#"{"env":{"ANTHROPIC_BASE_URL":"https://api.anthropic.com"}}"#
        ));
    }

    #[test]
    fn detection_covers_every_known_agent() {
        let agents = detect("http://127.0.0.1:8081");
        assert_eq!(agents.len(), KNOWN_AGENTS.len());
        let names: Vec<&str> = agents.iter().map(|a| a.agent_name.as_str()).collect();
        assert!(names.contains(&"claude-code"));
        assert!(names.contains(&"codex"));
    }

    #[test]
    fn refresh_persists_agent_rows() {
        let (store, _dir) = crate::store::test_support::open_store();
        let agents = refresh(&store, "http://127.0.0.1:8081").expect("refresh");
        let listed = store.list_agents().expect("list");
        assert_eq!(listed.len(), agents.len());
    }
}
