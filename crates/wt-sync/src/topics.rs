//! Topic registry and source routing.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;

pub const TOPICS_FILE: &str = "topics.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicEntry {
    pub name: String,
    /// Free-text search expansion sent to search-style upstreams.
    pub query: String,
    /// Served by the fast source instead of the affiliation-geocoding sources.
    #[serde(default)]
    pub fast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicRegistry {
    #[serde(default = "default_fast_source")]
    pub fast_source: String,
    #[serde(default = "default_slow_sources")]
    pub slow_sources: Vec<String>,
    pub topics: Vec<TopicEntry>,
}

fn default_fast_source() -> String {
    "paper-index".to_string()
}

fn default_slow_sources() -> Vec<String> {
    vec!["affiliation-index".to_string(), "citation-graph".to_string()]
}

/// Where one topic request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Fast {
        source_id: String,
        topic: String,
        query: String,
    },
    Slow {
        source_ids: Vec<String>,
        topic: String,
        query: String,
    },
    /// No topic selected: every fast topic against the fast source.
    FanOut {
        source_id: String,
        topics: Vec<(String, String)>,
    },
}

pub fn is_all_topics(topic: &str) -> bool {
    let topic = topic.trim();
    topic.is_empty() || topic.eq_ignore_ascii_case("all")
}

impl Default for TopicRegistry {
    fn default() -> Self {
        let entry = |name: &str, query: &str, fast: bool| TopicEntry {
            name: name.to_string(),
            query: query.to_string(),
            fast,
        };
        Self {
            fast_source: default_fast_source(),
            slow_sources: default_slow_sources(),
            topics: vec![
                entry("AI", "artificial intelligence", true),
                entry("Space", "space exploration OR astronomy OR astrophysics", true),
                entry("Environment", "climate change OR environmental science OR ecology", true),
                entry("Technology", "machine learning OR computer science", false),
                entry("Climate", "climate change OR global warming", false),
                entry("Medicine", "medical research OR healthcare", false),
                entry("Quantum", "quantum computing OR quantum physics", false),
            ],
        }
    }
}

impl TopicRegistry {
    /// Load `topics.yaml` from the workspace root, or the built-in registry when absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(TOPICS_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        if registry.slow_sources.is_empty() {
            anyhow::bail!("topic registry needs at least one slow source");
        }
        Ok(registry)
    }

    pub fn entry(&self, topic: &str) -> Option<&TopicEntry> {
        let topic = topic.trim();
        self.topics.iter().find(|t| t.name.eq_ignore_ascii_case(topic))
    }

    /// Source ids this registry can route to, fast source first.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids = vec![self.fast_source.clone()];
        for id in &self.slow_sources {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn route(&self, topic: &str) -> Route {
        if is_all_topics(topic) {
            return Route::FanOut {
                source_id: self.fast_source.clone(),
                topics: self
                    .topics
                    .iter()
                    .filter(|t| t.fast)
                    .map(|t| (t.name.clone(), t.query.clone()))
                    .collect(),
            };
        }
        match self.entry(topic) {
            Some(entry) if entry.fast => Route::Fast {
                source_id: self.fast_source.clone(),
                topic: entry.name.clone(),
                query: entry.query.clone(),
            },
            Some(entry) => Route::Slow {
                source_ids: self.slow_sources.clone(),
                topic: entry.name.clone(),
                query: entry.query.clone(),
            },
            None => {
                let topic = topic.trim().to_string();
                Route::Slow {
                    source_ids: self.slow_sources.clone(),
                    query: topic.clone(),
                    topic,
                }
            }
        }
    }
}
