use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Minimum number of actions an episode needs before it counts as complete.
pub const MIN_EPISODE_ACTIONS: usize = 5;

/// One dialogue/stage-direction beat. Ordering within an episode is playback
/// order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Action {
    pub character: String,
    #[serde(default)]
    pub voice_line: String,
    #[serde(default)]
    pub looking_at: String,
    #[serde(default)]
    pub walking_to: String,
}

impl Action {
    pub fn new(character: &str) -> Self {
        Self {
            character: character.to_string(),
            voice_line: String::new(),
            looking_at: String::new(),
            walking_to: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Location {
    pub title: String,
    #[serde(rename = "interactableObjects", default)]
    pub interactable_objects: Vec<String>,
}

/// Caption + image (+ optional graph) shown on the in-scene blackboard.
/// Fields stay empty strings until the visualization stage fills them.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DisplayableContent {
    #[serde(default)]
    pub blackboard_caption: String,
    #[serde(default)]
    pub blackboard_image: String,
    #[serde(default)]
    pub blackboard_graph: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Episode {
    pub show_title: String,
    pub episode_title: String,
    pub characters: Vec<String>,
    #[serde(default)]
    pub displayable_content: DisplayableContent,
    pub location: Location,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Episode {
    /// Every construction receives freshly-owned containers; nothing is
    /// shared between instances.
    pub fn new(
        show_title: &str,
        episode_title: &str,
        characters: Vec<String>,
        location: Location,
    ) -> Self {
        Self {
            show_title: show_title.to_string(),
            episode_title: episode_title.to_string(),
            characters,
            displayable_content: DisplayableContent::default(),
            location,
            outline: String::new(),
            actions: Vec::new(),
        }
    }

    pub fn has_visualization(&self) -> bool {
        !self.displayable_content.blackboard_caption.is_empty()
            && !self.displayable_content.blackboard_image.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.has_visualization()
            && !self.outline.is_empty()
            && self.actions.len() >= MIN_EPISODE_ACTIONS
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        Ok(serde_json::from_str(json_str)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Characters and locations the front end can currently render. Shared with
/// the REST collaborator through a single JSON file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupportedScenes {
    pub characters: Vec<String>,
    pub locations: Vec<Location>,
}

impl SupportedScenes {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_episode() -> Episode {
        Episode {
            show_title: "Ai_Academia".to_string(),
            episode_title: "Random Walks".to_string(),
            characters: vec!["Alice".to_string(), "Feynman".to_string()],
            displayable_content: DisplayableContent {
                blackboard_caption: "<b>Random Walks</b>".to_string(),
                blackboard_image: "aGVsbG8=".to_string(),
                blackboard_graph: String::new(),
            },
            location: Location {
                title: "Classroom".to_string(),
                interactable_objects: vec!["Blackboard".to_string()],
            },
            outline: "An episode about random walks.".to_string(),
            actions: vec![
                Action {
                    character: "Alice".to_string(),
                    voice_line: "Welcome back!".to_string(),
                    looking_at: "Blackboard".to_string(),
                    walking_to: String::new(),
                },
                Action::new("Feynman"),
            ],
        }
    }

    #[test]
    fn episode_json_round_trips() {
        let episode = sample_episode();
        let json = episode.to_json().unwrap();
        let parsed = Episode::from_json(&json).unwrap();
        assert_eq!(parsed, episode);
        // Reserialization is byte-stable.
        assert_eq!(parsed.to_json().unwrap(), json);
    }

    #[test]
    fn episode_json_uses_wire_field_names() {
        let json = sample_episode().to_json().unwrap();
        assert!(json.contains("\"show_title\""));
        assert!(json.contains("\"displayable_content\""));
        assert!(json.contains("\"blackboard_caption\""));
        assert!(json.contains("\"interactableObjects\""));
        assert!(json.contains("\"voice_line\""));
    }

    #[test]
    fn action_optional_fields_default_to_empty() {
        let action: Action = serde_json::from_str(r#"{"character": "Alice"}"#).unwrap();
        assert_eq!(action.character, "Alice");
        assert_eq!(action.voice_line, "");
        assert_eq!(action.looking_at, "");
        assert_eq!(action.walking_to, "");
    }

    #[test]
    fn action_without_character_is_rejected() {
        assert!(serde_json::from_str::<Action>(r#"{"voice_line": "hi"}"#).is_err());
    }

    #[test]
    fn completion_requires_outline_visualization_and_five_actions() {
        let mut episode = sample_episode();
        assert!(!episode.is_complete());

        episode.actions = (0..5).map(|_| Action::new("Alice")).collect();
        assert!(episode.is_complete());

        episode.outline.clear();
        assert!(!episode.is_complete());
        episode.outline = "outline".to_string();

        episode.displayable_content.blackboard_image.clear();
        assert!(!episode.is_complete());
    }
}
