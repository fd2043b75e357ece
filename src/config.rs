use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_show_title")]
    pub show_title: String,

    /// Shared JSON file describing which characters and locations the front
    /// end can currently render.
    #[serde(default = "default_scenes_file")]
    pub scenes_file: String,

    /// Titles the generator picks from when no external topic source is
    /// wired up.
    #[serde(default)]
    pub episode_titles: Vec<String>,

    pub backend: BackendConfig,

    #[serde(default)]
    pub pools: PoolConfig,

    #[serde(default = "default_scraped_images_dir")]
    pub scraped_images_dir: String,

    #[serde(default = "default_poll_file")]
    pub poll_file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Text models episodes are generated with; one is chosen per episode.
    pub models: Vec<String>,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Cheap model used by the example-pool topic classifier.
    #[serde(default = "default_categorizer_model")]
    pub categorizer_model: String,

    #[serde(default = "default_cache_file")]
    pub cache_file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_examples_dir")]
    pub examples_dir: String,
    #[serde(default = "default_released_dir")]
    pub released_dir: String,
    #[serde(default = "default_prioritized_dir")]
    pub prioritized_dir: String,
    #[serde(default = "default_unreleased_dir")]
    pub unreleased_dir: String,
    #[serde(default = "default_wip_dir")]
    pub wip_dir: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            examples_dir: default_examples_dir(),
            released_dir: default_released_dir(),
            prioritized_dir: default_prioritized_dir(),
            unreleased_dir: default_unreleased_dir(),
            wip_dir: default_wip_dir(),
        }
    }
}

fn default_show_title() -> String {
    "Ai_Academia".to_string()
}
fn default_scenes_file() -> String {
    "./cache/shared/supported_scenes.json".to_string()
}
fn default_scraped_images_dir() -> String {
    "./cache/scraped_images".to_string()
}
fn default_poll_file() -> String {
    "./cache/poll_votes.json".to_string()
}
fn default_base_url() -> String {
    "http://localhost:11434/api".to_string()
}
fn default_container_name() -> String {
    "ollama".to_string()
}
fn default_vision_model() -> String {
    "llava:v1.6".to_string()
}
fn default_categorizer_model() -> String {
    "zephyr".to_string()
}
fn default_cache_file() -> String {
    "./cache/ollama_cache.json".to_string()
}
fn default_examples_dir() -> String {
    "./few_shot_examples/episodes".to_string()
}
fn default_released_dir() -> String {
    "./cache/shared/StreamingAssets/released_episodes".to_string()
}
fn default_prioritized_dir() -> String {
    "./cache/shared/StreamingAssets/prioritized_episodes".to_string()
}
fn default_unreleased_dir() -> String {
    "./cache/shared/StreamingAssets/unreleased_episodes".to_string()
}
fn default_wip_dir() -> String {
    "./cache/WIP_episode".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.pools.examples_dir)?;
        fs::create_dir_all(&self.pools.released_dir)?;
        fs::create_dir_all(&self.pools.prioritized_dir)?;
        fs::create_dir_all(&self.pools.unreleased_dir)?;
        fs::create_dir_all(&self.pools.wip_dir)?;
        fs::create_dir_all(&self.scraped_images_dir)?;
        if let Some(parent) = Path::new(&self.backend.cache_file).parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = Path::new(&self.scenes_file).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
