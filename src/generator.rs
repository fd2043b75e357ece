use crate::config::Config;
use crate::episode::{Episode, SupportedScenes, MIN_EPISODE_ACTIONS};
use crate::fewshot::FewShotProvider;
use crate::ollama::{format_temperature, CompletionBackend, CompletionRequest};
use crate::recover::recover_action_list;
use crate::scraper::{ImageJudge, ImageSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{info, warn};
use rand::seq::IndexedRandom;

pub const INITIAL_TEMPERATURE: f32 = 0.75;
pub const TEMPERATURE_STEP: f32 = 0.1;
pub const TEMPERATURE_FLOOR: f32 = 0.1;

/// A generated batch is accepted with this many actions; the episode itself
/// needs [`MIN_EPISODE_ACTIONS`] before it completes, so a 4-action batch
/// triggers another full generation round.
pub const MIN_BATCH_ACTIONS: usize = 4;

pub const MAX_OUTLINE_REGENERATIONS: usize = 3;
pub const MAX_VISUALIZATION_ATTEMPTS: usize = 20;
pub const MAX_GENERATION_ROUNDS: usize = 12;

const MAX_CAPTION_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NeedsVisualization,
    NeedsOutline,
    NeedsActions,
    Complete,
}

/// Drives an episode through visualization, outline and action generation,
/// retrying with mutated temperature, outline and search terms until the
/// completion invariant holds or the budget runs out.
pub struct EpisodeGenerator<'a> {
    backend: &'a dyn CompletionBackend,
    fewshot: FewShotProvider<'a>,
    config: &'a Config,
    images: Box<dyn ImageSource>,
    model: String,
}

impl<'a> EpisodeGenerator<'a> {
    pub fn new(
        backend: &'a dyn CompletionBackend,
        config: &'a Config,
        images: Box<dyn ImageSource>,
        model: &str,
    ) -> Self {
        Self {
            backend,
            fewshot: FewShotProvider::new(backend, config),
            config,
            images,
            model: model.to_string(),
        }
    }

    pub fn stage(episode: &Episode) -> Stage {
        if !episode.has_visualization() {
            Stage::NeedsVisualization
        } else if !episode.actions.is_empty() && episode.outline.is_empty() {
            Stage::NeedsOutline
        } else if episode.actions.len() < MIN_EPISODE_ACTIONS {
            Stage::NeedsActions
        } else {
            Stage::Complete
        }
    }

    pub async fn generate(
        &mut self,
        episode_title: &str,
        scenes: &SupportedScenes,
    ) -> Result<Episode> {
        let location = {
            let mut rng = rand::rng();
            scenes
                .locations
                .choose(&mut rng)
                .ok_or_else(|| anyhow!("no supported locations configured"))?
                .clone()
        };

        let mut episode = Episode::new(
            &self.config.show_title,
            episode_title,
            scenes.characters.clone(),
            location,
        );
        self.run(&mut episode).await?;
        Ok(episode)
    }

    /// Dispatches stages until the episode is complete. Bounded so a model
    /// that consistently underperforms cannot spin forever.
    pub async fn run(&mut self, episode: &mut Episode) -> Result<()> {
        for _ in 0..MAX_GENERATION_ROUNDS {
            match Self::stage(episode) {
                Stage::Complete => return Ok(()),
                Stage::NeedsVisualization => self.generate_visualization(episode).await?,
                Stage::NeedsOutline => self.backfill_outline(episode).await?,
                Stage::NeedsActions => self.generate_actions(episode).await?,
            }
        }
        Err(anyhow!(
            "episode '{}' exhausted its generation budget",
            episode.episode_title
        ))
    }

    /// Back-fill path: actions were supplied without an outline.
    async fn backfill_outline(&mut self, episode: &mut Episode) -> Result<()> {
        let serialized = serde_json::to_string(&episode.actions)?;
        let prompt = format!(
            "Please author an outline of the following episode script of the show '{}' script: '''json\n{}\n'''",
            episode.show_title, serialized
        );
        episode.outline = self
            .backend
            .complete(CompletionRequest::text(&prompt, &self.model).seed("Sure! In this episode"))
            .await?;
        Ok(())
    }

    /// Two-level retry: an inner temperature ladder per outline, an outer
    /// outline regeneration when the ladder bottoms out. An outline that
    /// keeps producing unparsable actions is presumed to be the root cause.
    async fn generate_actions(&mut self, episode: &mut Episode) -> Result<()> {
        let mut regenerations = 0;
        loop {
            if episode.outline.is_empty() {
                episode.outline = self
                    .fewshot
                    .topic_to_outline(
                        &episode.episode_title,
                        &episode.characters,
                        &episode.location,
                        &self.model,
                        &episode.show_title,
                    )
                    .await?;
            }

            let mut temperature = INITIAL_TEMPERATURE;
            loop {
                let raw = match self
                    .fewshot
                    .outline_to_actions(&episode.outline, &self.model, temperature)
                    .await
                {
                    Ok(text) => text,
                    // Transport and remembered-failure errors count as
                    // ordinary failed attempts here.
                    Err(e) => {
                        warn!("Action generation request failed: {:#}", e);
                        String::new()
                    }
                };

                let actions = recover_action_list(&raw);
                temperature = step_down(temperature);

                if actions.len() >= MIN_BATCH_ACTIONS {
                    episode.actions = actions;
                    return Ok(());
                }

                warn!(
                    "Received {} usable actions. Adjusting temperature to {} and retrying...",
                    actions.len(),
                    format_temperature(temperature)
                );
                if temperature <= TEMPERATURE_FLOOR + f32::EPSILON {
                    break;
                }
            }

            regenerations += 1;
            if regenerations > MAX_OUTLINE_REGENERATIONS {
                return Err(anyhow!(
                    "action generation failed across {} outlines for '{}'",
                    regenerations,
                    episode.episode_title
                ));
            }
            warn!("Outline appears to defeat action generation; requesting a fresh one");
            episode.outline.clear();
        }
    }

    /// Hunts for a topical image, deriving a fresh search term after every
    /// failed hunt, then fills in image, title side effect and caption.
    async fn generate_visualization(&mut self, episode: &mut Episode) -> Result<()> {
        let topic = episode.episode_title.clone();
        reset_snapshot_dir(&self.config.scraped_images_dir);

        let mut search_term = topic.clone();
        for _ in 0..MAX_VISUALIZATION_ATTEMPTS {
            let judge = TopicJudge {
                backend: self.backend,
                fewshot: &self.fewshot,
                snapshot_dir: self.config.scraped_images_dir.clone(),
                vision_model: self.config.backend.vision_model.clone(),
                topic: topic.clone(),
                model: self.model.clone(),
            };
            info!("SEARCHED KEYWORD: {}", search_term);

            if let Some(image) = self.images.find_image(&search_term, &judge).await? {
                return self.apply_visualization(episode, &topic, image).await;
            }

            match self.fewshot.topic_to_search_term(&topic, &self.model).await {
                Ok(term) => {
                    warn!(
                        "Did not find any appropriate image on the web! New search term: {}",
                        term
                    );
                    search_term = term;
                }
                Err(e) => warn!("Search term derivation failed: {:#}", e),
            }
        }
        Err(anyhow!("no acceptable visualization found for '{}'", topic))
    }

    async fn apply_visualization(
        &self,
        episode: &mut Episode,
        topic: &str,
        image: String,
    ) -> Result<()> {
        let description = describe_image(
            self.backend,
            &self.config.backend.vision_model,
            &image,
        )
        .await
        .unwrap_or_default();

        let titled = self
            .backend
            .complete(
                CompletionRequest::text(
                    &format!(
                        "Come up with a title for the image. Here is the image description: '{}'",
                        description
                    ),
                    &self.model,
                )
                .seed("Sure! A fitting title would be: 'Image of "),
            )
            .await?;
        let image_title = titled.split('\'').nth(1).unwrap_or_default().to_string();

        episode
            .location
            .interactable_objects
            .push(format!("Blackboard image of: {}", image_title));
        episode.displayable_content.blackboard_image = image;

        let raw_caption = self
            .fewshot
            .blackboard_caption(topic, &image_title, &self.model)
            .await?;
        let mut caption = extract_caption(&raw_caption);

        if caption.chars().count() > MAX_CAPTION_CHARS {
            let condensed = self
                .backend
                .complete(
                    CompletionRequest::text(
                        &format!(
                            "Please boil down the following blackboard caption for use on a smaller blackboard.\n'''chalkboard_caption\n{}'''",
                            caption
                        ),
                        &self.model,
                    )
                    .seed("Sure! I will condense the caption while retaining its most important ideas.\n'''chalkboard_caption\n"),
                )
                .await?;
            caption = extract_caption(&condensed);
        }

        episode.displayable_content.blackboard_caption = caption;
        Ok(())
    }
}

fn step_down(temperature: f32) -> f32 {
    ((temperature - TEMPERATURE_STEP) * 100.0).round() / 100.0
}

fn extract_caption(text: &str) -> String {
    if let Some(start) = text.find("'''chalkboard_caption") {
        let after = &text[start + "'''chalkboard_caption".len()..];
        let inner = match after.find("'''") {
            Some(end) => &after[..end],
            None => after,
        };
        let trimmed = inner.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    text.trim().to_string()
}

async fn describe_image(
    backend: &dyn CompletionBackend,
    vision_model: &str,
    image: &str,
) -> Option<String> {
    let description = backend
        .complete(
            CompletionRequest::text("What is shown in the image?", vision_model)
                .images(vec![image.to_string()]),
        )
        .await;
    match description {
        Ok(text) if !text.is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            warn!("Image description failed: {:#}", e);
            None
        }
    }
}

fn reset_snapshot_dir(dir: &str) {
    let _ = std::fs::remove_dir_all(dir);
    let _ = std::fs::create_dir_all(dir);
}

/// The acceptability predicate handed to the image source: describe the
/// candidate, then judge the description against the topic.
struct TopicJudge<'a> {
    backend: &'a dyn CompletionBackend,
    fewshot: &'a FewShotProvider<'a>,
    snapshot_dir: String,
    vision_model: String,
    topic: String,
    model: String,
}

impl TopicJudge<'_> {
    fn snapshot(&self, image_base64: &str) {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(image_base64) else {
            return;
        };
        let index = std::fs::read_dir(&self.snapshot_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        let _ = std::fs::write(format!("{}/{}.jpg", self.snapshot_dir, index), bytes);
    }
}

#[async_trait]
impl ImageJudge for TopicJudge<'_> {
    async fn accepts(&self, image_base64: &str) -> Result<bool> {
        self.snapshot(image_base64);

        let Some(description) =
            describe_image(self.backend, &self.vision_model, image_base64).await
        else {
            return Ok(false);
        };

        let verdict = self
            .fewshot
            .is_image_topic_appropriate(&self.topic, &description, &self.model)
            .await?;
        let verdict = self.fewshot.convert_to_yes_no(&verdict, &self.model).await?;

        info!("TOPIC: {}", self.topic);
        info!("image description: {}", description);
        info!("topic fit verdict: {}", verdict);

        Ok(verdict.to_lowercase().contains("yes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::{Action, DisplayableContent, Location};
    use crate::ollama::Prompt;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn pool_episode(title: &str) -> Episode {
        Episode {
            show_title: "Ai_Academia".to_string(),
            episode_title: title.to_string(),
            characters: vec!["Alice".to_string()],
            displayable_content: DisplayableContent::default(),
            location: Location {
                title: "Classroom".to_string(),
                interactable_objects: vec!["Blackboard".to_string()],
            },
            outline: format!("Outline for {}", title),
            actions: (0..8)
                .map(|i| Action {
                    character: "Alice".to_string(),
                    voice_line: format!("line {}", i),
                    looking_at: String::new(),
                    walking_to: String::new(),
                })
                .collect(),
        }
    }

    fn write_pools(dir: &Path) {
        for i in 0..4 {
            let episode_dir = dir.join(format!("episode_{}", i));
            std::fs::create_dir_all(&episode_dir).unwrap();
            std::fs::write(
                episode_dir.join("actions.json"),
                pool_episode("Fractals").to_json().unwrap(),
            )
            .unwrap();
        }
    }

    fn test_config(root: &Path) -> Config {
        let yaml = format!(
            "backend:\n  models:\n    - phi3\nscraped_images_dir: {}\npools:\n  examples_dir: {}\n  released_dir: {}\n  prioritized_dir: {}\n  unreleased_dir: {}\n",
            root.join("scraped").display(),
            root.join("examples").display(),
            root.join("released").display(),
            root.join("prioritized").display(),
            root.join("unreleased").display(),
        );
        serde_yaml_ng::from_str(&yaml).unwrap()
    }

    fn valid_actions_json(count: usize) -> String {
        let actions: Vec<Action> = (0..count)
            .map(|i| Action {
                character: "Alice".to_string(),
                voice_line: format!("generated line {}", i),
                looking_at: String::new(),
                walking_to: String::new(),
            })
            .collect();
        serde_json::to_string(&actions).unwrap()
    }

    /// Scripted backend that routes on prompt content and keeps an ordered
    /// call log.
    #[derive(Debug, Default)]
    struct ScriptedBackend {
        /// Raw action text per formatted temperature; anything missing
        /// yields unparsable output.
        actions_by_temperature: HashMap<String, String>,
        log: Mutex<Vec<String>>,
        outline_count: Mutex<usize>,
    }

    impl ScriptedBackend {
        fn log_entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            let (system, last_user) = match &request.prompt {
                Prompt::Chat(chat) => {
                    let system = chat
                        .messages
                        .first()
                        .map(|(_, content)| content.clone())
                        .unwrap_or_default();
                    let last_user = chat
                        .messages
                        .last()
                        .map(|(_, content)| content.clone())
                        .unwrap_or_default();
                    (system, last_user)
                }
                Prompt::Text(text) => (String::new(), text.clone()),
            };

            if !request.images.is_empty() {
                return Ok("A colorful fractal diagram.".to_string());
            }
            if last_user.starts_with("Come up with a title") {
                return Ok("Sure! A fitting title would be: 'Image of a Fractal Zoom'.".to_string());
            }
            if last_user.starts_with("Please author an outline") {
                return Ok("Sure! In this episode the cast explores the topic.".to_string());
            }
            if system.contains("Transform the narrative") {
                let temperature = format_temperature(request.temperature);
                self.log.lock().unwrap().push(format!("actions@{}", temperature));
                return Ok(self
                    .actions_by_temperature
                    .get(&temperature)
                    .cloned()
                    .unwrap_or_else(|| "the model rambles instead of emitting records".to_string()));
            }
            if system.contains("Imagine you're a highly advanced AI") {
                let mut count = self.outline_count.lock().unwrap();
                *count += 1;
                self.log.lock().unwrap().push("outline".to_string());
                return Ok(format!("Fresh outline #{}", count));
            }
            if system.contains("topic-to-search-term") {
                return Ok("Fractal Zoom Diagram' should find one.".to_string());
            }
            if system.contains("YES or NO converter") {
                return Ok("YES".to_string());
            }
            if system.contains("step by step") {
                return Ok("The description clearly relates to the topic.".to_string());
            }
            if system.contains("responding factually") {
                return Ok(
                    "Sure!\n'''chalkboard_caption\n<u><b>Key Ideas</b></u>\n- It scales.'''"
                        .to_string(),
                );
            }
            if last_user.contains("Categorize the title") {
                return Ok("Science and Mathematics".to_string());
            }
            Ok(String::new())
        }
    }

    /// Image source stub: fails the first `failures` hunts, then offers its
    /// image to the judge.
    struct StubImages {
        image: String,
        failures: usize,
        terms: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ImageSource for StubImages {
        async fn find_image(
            &mut self,
            search_term: &str,
            judge: &dyn ImageJudge,
        ) -> Result<Option<String>> {
            self.terms.lock().unwrap().push(search_term.to_string());
            if self.failures > 0 {
                self.failures -= 1;
                return Ok(None);
            }
            if judge.accepts(&self.image).await.unwrap_or(false) {
                Ok(Some(self.image.clone()))
            } else {
                Ok(None)
            }
        }
    }

    fn stub_images(failures: usize, terms: Arc<Mutex<Vec<String>>>) -> Box<dyn ImageSource> {
        Box::new(StubImages {
            image: base64::engine::general_purpose::STANDARD.encode(b"image bytes"),
            failures,
            terms,
        })
    }

    fn visualized_episode() -> Episode {
        Episode {
            show_title: "Ai_Academia".to_string(),
            episode_title: "Fractals".to_string(),
            characters: vec!["Alice".to_string()],
            displayable_content: DisplayableContent {
                blackboard_caption: "caption".to_string(),
                blackboard_image: "aW1n".to_string(),
                blackboard_graph: String::new(),
            },
            location: Location {
                title: "Classroom".to_string(),
                interactable_objects: vec!["Blackboard".to_string()],
            },
            outline: String::new(),
            actions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn accepts_actions_lower_on_the_temperature_ladder() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        let mut backend = ScriptedBackend::default();
        backend
            .actions_by_temperature
            .insert("0.45".to_string(), valid_actions_json(6));

        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(0, terms), "phi3");

        let mut episode = visualized_episode();
        episode.outline = "Preset outline".to_string();

        generator.run(&mut episode).await.unwrap();

        assert_eq!(episode.actions.len(), 6);
        assert!(episode.is_complete());

        let log = backend.log_entries();
        assert_eq!(
            log,
            vec!["actions@0.75", "actions@0.65", "actions@0.55", "actions@0.45"]
        );
        // The preset outline survived: no regeneration happened.
        assert_eq!(*backend.outline_count.lock().unwrap(), 0);
        assert_eq!(episode.outline, "Preset outline");
    }

    #[tokio::test]
    async fn regenerates_outline_after_the_ladder_bottoms_out() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        // No temperature ever yields a parsable batch.
        let backend = ScriptedBackend::default();

        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(0, terms), "phi3");

        let mut episode = visualized_episode();
        let err = generator.run(&mut episode).await.unwrap_err();
        assert!(err.to_string().contains("action generation failed"));

        let ladder: Vec<String> = ["0.75", "0.65", "0.55", "0.45", "0.35", "0.25", "0.15"]
            .iter()
            .map(|t| format!("actions@{}", t))
            .collect();

        let log = backend.log_entries();
        // First outline, full ladder, then exactly one new outline before the
        // ladder restarts at 0.75.
        assert_eq!(log[0], "outline");
        assert_eq!(log[1..8].to_vec(), ladder);
        assert_eq!(log[8], "outline");
        assert_eq!(log[9], "actions@0.75");

        // Bounded: the initial outline plus every allowed regeneration.
        assert_eq!(
            *backend.outline_count.lock().unwrap(),
            1 + MAX_OUTLINE_REGENERATIONS
        );
    }

    #[tokio::test]
    async fn four_action_batches_never_complete_an_episode() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        let mut backend = ScriptedBackend::default();
        // Every ladder entry yields an accepted-but-small batch of 4.
        for temperature in ["0.75", "0.65", "0.55", "0.45", "0.35", "0.25", "0.15"] {
            backend
                .actions_by_temperature
                .insert(temperature.to_string(), valid_actions_json(4));
        }

        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(0, terms), "phi3");

        let mut episode = visualized_episode();
        episode.outline = "Preset outline".to_string();

        let err = generator.run(&mut episode).await.unwrap_err();
        assert!(err.to_string().contains("exhausted its generation budget"));

        // The 4-action batch was accepted into the episode, but never counted
        // as complete.
        assert_eq!(episode.actions.len(), 4);
        assert!(!episode.is_complete());
        assert_ne!(EpisodeGenerator::stage(&episode), Stage::Complete);
    }

    #[tokio::test]
    async fn visualization_sets_caption_image_and_interactable() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        let mut backend = ScriptedBackend::default();
        backend
            .actions_by_temperature
            .insert("0.75".to_string(), valid_actions_json(5));

        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(0, terms.clone()), "phi3");

        let scenes = SupportedScenes {
            characters: vec!["Alice".to_string(), "Feynman".to_string()],
            locations: vec![Location {
                title: "Classroom".to_string(),
                interactable_objects: vec!["Blackboard".to_string()],
            }],
        };

        let episode = generator.generate("Fractals", &scenes).await.unwrap();

        assert!(episode.is_complete());
        assert!(!episode.displayable_content.blackboard_caption.is_empty());
        assert!(!episode.displayable_content.blackboard_image.is_empty());
        assert!(episode
            .displayable_content
            .blackboard_caption
            .contains("Key Ideas"));

        // Exactly one new interactable referencing the chosen image title.
        let added: Vec<&String> = episode
            .location
            .interactable_objects
            .iter()
            .filter(|obj| obj.starts_with("Blackboard image of: "))
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0], "Blackboard image of: Image of a Fractal Zoom");

        // The first hunt used the episode title itself.
        assert_eq!(terms.lock().unwrap().first().unwrap(), "Fractals");
    }

    #[tokio::test]
    async fn presupplied_actions_get_their_outline_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        let backend = ScriptedBackend::default();
        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(0, terms), "phi3");

        let mut episode = visualized_episode();
        episode.actions = (0..6)
            .map(|_| Action {
                character: "Alice".to_string(),
                voice_line: "imported line".to_string(),
                looking_at: String::new(),
                walking_to: String::new(),
            })
            .collect();
        assert_eq!(EpisodeGenerator::stage(&episode), Stage::NeedsOutline);

        generator.run(&mut episode).await.unwrap();

        assert_eq!(
            episode.outline,
            "Sure! In this episode the cast explores the topic."
        );
        // The imported actions survived untouched.
        assert_eq!(episode.actions.len(), 6);
        assert!(episode.is_complete());
    }

    #[tokio::test]
    async fn failed_hunts_derive_a_fresh_search_term() {
        let dir = tempfile::tempdir().unwrap();
        write_pools(&dir.path().join("examples"));
        let config = test_config(dir.path());

        let mut backend = ScriptedBackend::default();
        backend
            .actions_by_temperature
            .insert("0.75".to_string(), valid_actions_json(6));

        let terms = Arc::new(Mutex::new(Vec::new()));
        let mut generator =
            EpisodeGenerator::new(&backend, &config, stub_images(1, terms.clone()), "phi3");

        let mut episode = visualized_episode();
        episode.displayable_content = DisplayableContent::default();
        episode.outline = "Preset outline".to_string();

        generator.run(&mut episode).await.unwrap();

        let terms = terms.lock().unwrap();
        assert_eq!(terms.as_slice(), ["Fractals", "Fractal Zoom Diagram"]);
    }
}
