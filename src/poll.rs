use crate::episode::Episode;
use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const OPTION_LETTERS: [&str; 3] = ["A", "B", "C"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PollOption {
    pub letter: String,
    pub votes: u32,
    pub episode_title: String,
}

/// A snapshot of candidate next-episode titles with vote counters. Owned by
/// the REST collaborator; built here from generated episode metadata.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Poll {
    #[serde(rename = "pollOptions")]
    pub poll_options: Vec<PollOption>,
}

impl Poll {
    /// Samples three episode directories (with replacement, matching how the
    /// poll has always been drawn) and letters them A through C.
    pub fn from_episode_dirs(episode_dirs: &[PathBuf]) -> Result<Self> {
        let mut rng = rand::rng();
        let mut poll = Poll::default();
        for letter in OPTION_LETTERS {
            let Some(dir) = episode_dirs.choose(&mut rng) else {
                break;
            };
            poll.poll_options.push(PollOption {
                letter: letter.to_string(),
                votes: 0,
                episode_title: episode_title_of(dir)?,
            });
        }
        Ok(poll)
    }

    /// Counts a chat message as a vote iff it is exactly an option's letter.
    pub fn update_votes(&mut self, message: &str) {
        for option in &mut self.poll_options {
            if message == option.letter {
                option.votes += 1;
            }
        }
    }

    /// Atomic overwrite: the collaborator polling this file never observes a
    /// partial write.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path).context("Failed to replace poll file")?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn episode_title_of(episode_dir: &Path) -> Result<String> {
    let content = std::fs::read_to_string(episode_dir.join("actions.json"))
        .with_context(|| format!("Failed to read episode at {:?}", episode_dir))?;
    Ok(Episode::from_json(&content)?.episode_title)
}
