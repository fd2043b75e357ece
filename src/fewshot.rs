use crate::chat::{Chat, Role};
use crate::config::Config;
use crate::episode::{Episode, Location, MIN_EPISODE_ACTIONS};
use crate::ollama::{CompletionBackend, CompletionRequest};
use anyhow::{anyhow, Context, Result};
use log::warn;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::path::{Path, PathBuf};

/// A viewer message from the livestream chat, handed over by the
/// chat-ingestion collaborator.
#[derive(Debug, Clone)]
pub struct ViewerMessage {
    pub author: String,
    pub message: String,
}

const CATEGORIES: [&str; 7] = [
    "Travel and Lifestyle",
    "Philosophy and Psychology",
    "Computer Science and Technology",
    "Science and Mathematics",
    "Economics and Business",
    "Environmental Studies",
    "Miscellaneous",
];

/// Builds example-conditioned conversations for every generation task. Owns
/// no retry logic; retries belong to the state machine driving it.
pub struct FewShotProvider<'a> {
    backend: &'a dyn CompletionBackend,
    config: &'a Config,
}

impl<'a> FewShotProvider<'a> {
    pub fn new(backend: &'a dyn CompletionBackend, config: &'a Config) -> Self {
        Self { backend, config }
    }

    /// Collects between 3 and pool-size example episodes. Without a topic the
    /// curated exemplar pool is sampled; with one, previously generated
    /// episodes are pooled, ordered by the topic classifier's verdict, with a
    /// small chance of an unrelated exemplar for diversity.
    pub async fn examples(&self, topic: Option<&str>) -> Result<Vec<Episode>> {
        let curated = list_episode_dirs(&self.config.pools.examples_dir);

        let pool = if let Some(topic) = topic {
            let generated: Vec<PathBuf> = [
                &self.config.pools.released_dir,
                &self.config.pools.prioritized_dir,
                &self.config.pools.unreleased_dir,
            ]
            .iter()
            .flat_map(|dir| list_episode_dirs(dir))
            .collect();

            let topic_category = self
                .title_to_category(topic, &self.config.backend.categorizer_model)
                .await
                .unwrap_or_default();

            let mut matching = Vec::new();
            let mut rest = Vec::new();
            for path in generated {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                match self
                    .title_to_category(&name, &self.config.backend.categorizer_model)
                    .await
                {
                    Ok(category) if !topic_category.is_empty() && topic_category.contains(category.trim()) => {
                        matching.push(path)
                    }
                    Ok(_) => rest.push(path),
                    Err(e) => {
                        warn!("Failed to categorize example '{}': {}", name, e);
                        rest.push(path);
                    }
                }
            }

            assemble_topic_pool(matching, rest, &curated)
        } else {
            curated.clone()
        };

        if pool.is_empty() {
            return Err(anyhow!("no few-shot example episodes available"));
        }

        sample_episodes(&pool)
    }

    pub async fn topic_to_outline(
        &self,
        episode_title: &str,
        characters: &[String],
        location: &Location,
        model: &str,
        show_title: &str,
    ) -> Result<String> {
        let examples = self.examples(Some(episode_title)).await?;

        fn instruction(show: &str, title: &str, characters: &[String], location: &Location) -> String {
            format!(
                "Hi, please come up with an episode of \"{}\" revolving around the topic of \"{}\" \
                 and populated by the characters \"{}\". The location contains the objects: [{}] \
                 with which the characters can interact with.",
                show,
                title,
                characters.join(", "),
                location.interactable_objects.join(", ")
            )
        }

        fn response_start(title: &str, outline: &str) -> String {
            format!(
                "Sure! Here's an outline for an educational episode about the topic of \"{}\":\n{}",
                title, outline
            )
        }

        let mut chat = Chat::new(
            "Imagine you're a highly advanced AI, endowed with vast knowledge and creativity. Your \
             mission is to craft an original and captivating show designed to educate a global \
             audience on diverse topics, from science and history to art and technology. Each \
             episode should be rich in facts yet engaging, blending storytelling with enlightening \
             insights to spark curiosity and inspire learning. The aim is not just to inform, but \
             to mesmerize viewers, making complex subjects accessible and fascinating for people \
             of all ages.",
        );
        for example in &examples {
            chat.add(
                Role::User,
                &instruction(
                    &example.show_title,
                    &example.episode_title,
                    &example.characters,
                    &example.location,
                ),
            );
            chat.add(
                Role::Assistant,
                &response_start(&example.episode_title, &example.outline),
            );
        }
        chat.add(
            Role::User,
            &instruction(show_title, episode_title, characters, location),
        );

        self.backend
            .complete(
                CompletionRequest::chat(chat, model)
                    .seed(&response_start(episode_title, ""))
                    .without_seed_in_output(),
            )
            .await
    }

    /// Returns the raw model text; the recovery parser decides what survived.
    pub async fn outline_to_actions(
        &self,
        outline: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String> {
        let examples = self.examples(None).await?;

        let mut chat = Chat::new(
            "Transform the narrative provided into the designated JSON structure. Following this, \
             create a dynamic and immersive dialogue within the story, ensuring each character's \
             voice contributes to an explorative and captivating experience for the reader. Pay \
             special attention to enhance its interactive and narrative depth through the dialogue.",
        );
        for example in &examples {
            chat.add(Role::User, &example.outline);
            chat.add(
                Role::Assistant,
                &format!("'''json\n{}\n'''", serde_json::to_string(&example.actions)?),
            );
        }
        chat.add(Role::User, outline);

        let seed = action_list_seed(&examples[0]);

        self.backend
            .complete(
                CompletionRequest::chat(chat, model)
                    .seed(&seed)
                    .temperature(temperature),
            )
            .await
    }

    pub async fn title_to_category(&self, title: &str, model: &str) -> Result<String> {
        fn instruction(title: &str) -> String {
            format!(
                "Categorize the title '{}' into one of the following categories: {:?}",
                title, CATEGORIES
            )
        }

        let mut chat =
            Chat::new("You are a helpful assistant. Respond to the users request accurately and concisely.");
        let exemplars = [
            ("The_Future_After_the_Singularity_of_AI", "Computer Science and Technology"),
            ("Board_Games_and_Family_Entertainment", "Travel and Lifestyle"),
            ("0_llama2_uncensored_Renewable_Energy_Sources", "Environmental Studies"),
            ("0_llama2_uncensored_Julia_Sets", "Science and Mathematics"),
            ("0_openhermes_Psychological_Impact_of_Social_Media", "Philosophy and Psychology"),
            ("0_openhermes_Microsoft", "Economics and Business"),
            ("0_starling_lm_Easy_Healthy_Recipes", "Travel and Lifestyle"),
        ];
        for (example_title, category) in exemplars {
            chat.add(Role::User, &instruction(example_title));
            chat.add(Role::Assistant, category);
        }
        chat.add(Role::User, &instruction(title));

        let response = self
            .backend
            .complete(CompletionRequest::chat(chat, model))
            .await?;
        Ok(response.trim().to_string())
    }

    pub async fn is_image_topic_appropriate(
        &self,
        topic: &str,
        image_description: &str,
        model: &str,
    ) -> Result<String> {
        fn instruction(topic: &str, description: &str) -> String {
            format!(
                "Does the following text describe an image related to '{}'?\n'{}'",
                topic, description
            )
        }

        let mut chat = Chat::new(
            "You are a helpful assistant. You respond accurately to the users request, by reasoning step by step.",
        );
        let exemplars = [
            (
                "physics",
                "The image shows the logo of wikipedia",
                "The logo of wikipedia is not directly related to the topic of physics.",
            ),
            (
                "Health benefits of avocados",
                "The image depicts an infochart about nutrition.",
                "The infochart about nutrition does relate to health benefits.",
            ),
            (
                "Julia Sets",
                "In this image, there is a very detailed and complicated looking wave pattern or fractal type pattern on a purple background. The image also includes numbers and arrows pointing to different parts of the wave formation.",
                "The fractal type patterns in the image may represent Julia Sets.",
            ),
            (
                "GPT-4",
                "OpenAI logo",
                "The OpenAI logo does not directly relate to GPT-4, but as they are the makers of its predecessor 'gpt-3.5' a connection may be drawn.",
            ),
        ];
        for (example_topic, description, verdict) in exemplars {
            chat.add(Role::User, &instruction(example_topic, description));
            chat.add(Role::Assistant, verdict);
        }
        chat.add(Role::User, &instruction(topic, image_description));

        self.backend
            .complete(CompletionRequest::chat(chat, model))
            .await
    }

    pub async fn convert_to_yes_no(&self, text: &str, model: &str) -> Result<String> {
        let mut chat = Chat::new(
            "You are a YES or NO converter. Understand the user prompt and convert it to the more fitting sentiment.",
        );
        let exemplars = [
            ("I really do like yogurt.", "YES"),
            ("No one ever dislikes math homework!", "NO"),
            ("The infochart about nutrition does relate to health benefits.", "YES"),
            ("The fractal type patterns in the image may represent Julia Sets.", "YES"),
            ("The logo of wikipedia is not directly related to the topic of physics.", "NO"),
        ];
        for (statement, verdict) in exemplars {
            chat.add(Role::User, statement);
            chat.add(Role::Assistant, verdict);
        }
        chat.add(Role::User, text);

        self.backend
            .complete(CompletionRequest::chat(chat, model).temperature(0.5))
            .await
    }

    pub async fn blackboard_caption(
        &self,
        topic: &str,
        image_title: &str,
        model: &str,
    ) -> Result<String> {
        fn instruction(topic: &str, image_title: &str) -> String {
            format!(
                "Compose a concise, instructive chalkboard caption for the topic '{}', to \
                 complement an illustrative image titled '{}'. Use Rich Text Formatting to enhance \
                 readability and emphasis. The caption should be brief yet comprehensive, \
                 encapsulating essential ideas and concepts pivotal for grasping the fundamentals \
                 of the topic.",
                topic, image_title
            )
        }

        let mut chat = Chat::new(
            "You are a helpful AI assistant. You comply with the users requests by responding factually and concisely.",
        );

        chat.add(
            Role::User,
            &instruction(
                "Exploring the Mandelbrot Set: A Journey into Fractal Geometry",
                "The image shows a fractal pattern which is likely related to the Mandelbrot set.",
            ),
        );
        chat.add(
            Role::Assistant,
            "Sure!\n'''chalkboard_caption\n<u><b>Mandelbrot Set Overview</b></u>\n\n\
             <color=#808080><i>Definition:</i></color>\n\
             - Complex numbers: <color=#00BFFF>Real</color> and <color=purple>Imaginary</color> parts.\n\n\
             <color=#808080><i>Formula:</i></color>\n\
             - <color=green>z<sub>n+1</sub> = z<sub>n</sub>^2 + c</color>: Heart of fractal iterations.\n\n\
             <color=#808080><i>Fractal Nature:</i></color>\n\
             - Infinite complexity, <color=orange>self-similar</color> patterns at every scale.\n\n\
             <color=#808080><i>Visual Beauty:</i></color>\n\
             - Colors indicate <color=red>divergence speed</color>: A spectrum in chaos.'''",
        );

        chat.add(
            Role::User,
            &instruction(
                "The Incredible Journey: Human Evolution",
                "The image shows an Infochart about the timeline of human evolution.",
            ),
        );
        chat.add(
            Role::Assistant,
            "Sure!\n'''chalkboard_caption\n<u><b>Human Evolution: An Incredible Journey</b></u>\n\n\
             <color=#008000><i>Key Milestones:</i></color>\n\
             - <color=#800080>Australopithecus:</color> The first step in bipedalism.\n\
             - <color=#FFA500>Homo habilis:</color> Early tool usage begins.\n\
             - <color=#1E90FF>Homo erectus:</color> Migration out of Africa.\n\
             - <color=#FF4500>Neanderthals:</color> Adaptation to colder climates.\n\
             - <color=#2E8B57>Modern Humans:</color> Development of complex societies.\n\n\
             <color=#808080><i>Evolutionary Significance:</i></color>\n\
             - Physical and cognitive changes over millennia.\n\
             - Adaptation to diverse environments and climates.\n\n\
             <color=#808080><i>Current Understanding:</i></color>\n\
             - Ongoing research and discoveries continuously reshape our understanding of human evolution.'''",
        );

        chat.add(Role::User, &instruction(topic, image_title));

        self.backend
            .complete(CompletionRequest::chat(chat, model).seed("Sure!\n'''chalkboard_caption\n"))
            .await
    }

    /// Distills a topic into a fresh image search term. Bypasses the cache
    /// and randomizes temperature so repeated calls diverge.
    pub async fn topic_to_search_term(&self, topic: &str, model: &str) -> Result<String> {
        fn instruction(topic: &str) -> String {
            format!(
                "Please provide a google searchterm for finding a good visualization of: '{}'",
                topic
            )
        }

        fn response(search_term: &str) -> String {
            format!(
                "Sure! You should be able to find appropriate visualizations by searching for: '{}'",
                search_term
            )
        }

        const SEED: &str =
            "Sure! You should be able to find appropriate visualizations by searching for: '";

        let mut chat = Chat::new(
            "As a highly specialized AI designed for topic-to-search-term conversion, your task is \
             to analyze the essence of any user-provided topic and distill it into a widely \
             recognized search term that best encapsulates the topic's core. This search term \
             should be particularly effective for finding visual representations related to the \
             topic. Ensure your response is succinct, focusing on a term that vividly brings the \
             topic to life through imagery and visual content.",
        );
        let exemplars = [
            ("Random Walks", "Random Walk Monte Carlo Visualization"),
            ("Natural Deduction", "Natural Deduction Rule Diagram"),
            ("Cell Division", "Mitosis and Meiosis Stages Diagram"),
            ("Cognitive Behavioral Therapy", "CBT Techniques Infographic"),
            ("Electoral Systems", "Comparative Electoral Systems Chart"),
            ("Renewable Energy Sources", "Solar and Wind Energy Infographic"),
            ("Human Evolution", "Hominid Evolutionary Tree"),
            ("Cellular Automata", "Conways Game of Life"),
        ];
        for (example_topic, term) in exemplars {
            chat.add(Role::User, &instruction(example_topic));
            chat.add(Role::Assistant, &response(term));
        }
        chat.add(Role::User, &instruction(topic));

        for _ in 0..10 {
            let temperature = ((0.6 + rand::random::<f32>() * 0.4) * 100.0).round() / 100.0;
            let completion = self
                .backend
                .complete(
                    CompletionRequest::chat(chat.clone(), model)
                        .seed(SEED)
                        .temperature(temperature)
                        .no_cache()
                        .without_seed_in_output(),
                )
                .await?;
            let term = completion.split('\'').next().unwrap_or("").trim().to_string();
            if !term.is_empty() {
                return Ok(term);
            }
        }
        Err(anyhow!("search-term conversion kept returning empty terms"))
    }

    /// Converts raw viewer chatter into a list of episode-worthy topics.
    pub async fn messages_to_topics(
        &self,
        messages: &[ViewerMessage],
        model: &str,
    ) -> Result<Vec<String>> {
        fn transcript(messages: &[ViewerMessage]) -> String {
            messages
                .iter()
                .map(|m| format!("{}: {}", m.author, m.message))
                .collect::<Vec<_>>()
                .join("\n")
        }

        let mut chat = Chat::new(
            "You are a helpful assistant. Convert the user provided text messages, into a comma separated list of topics.",
        );

        let first_round = [
            ("Hater41", "Please talk about the mandelbrot set."),
            ("ILoveMyself", "No don't, instead focus on the ukraine conflict."),
            ("ComputerNerd", "What even is this?"),
            ("PlantDigester", "Can we all not just get along?"),
            ("Hater41", "I hate all of you."),
            ("Hater41", "Did Richard Feynman study Physics or Maths?"),
        ];
        let first_round: Vec<ViewerMessage> = first_round
            .iter()
            .map(|(author, message)| ViewerMessage {
                author: author.to_string(),
                message: message.to_string(),
            })
            .collect();
        chat.add(Role::User, &transcript(&first_round));
        chat.add(
            Role::Assistant,
            &serde_json::to_string(&[
                "The mandelbrot set",
                "The ukraine conflict",
                "Richard Feynmans fields of study",
            ])?,
        );

        let second_round = [
            ("TechEnthusiast", "Let's discuss the latest advancements in AI technology."),
            ("HistoryBuff", "Can someone explain the significance of the Treaty of Versailles?"),
            ("RandomCommenter", "Why do cats always land on their feet? Just curious."),
            ("FoodLover", "I'm thinking about what to have for dinner, maybe pizza?"),
            ("SpaceExplorer", "Thoughts on the new Mars rover mission?"),
            ("EcoWarrior", "We should talk about climate change and renewable energy sources."),
            ("MysteryReader", "Has anyone read 'The Lost Symbol' by Dan Brown? Thoughts?"),
        ];
        let second_round: Vec<ViewerMessage> = second_round
            .iter()
            .map(|(author, message)| ViewerMessage {
                author: author.to_string(),
                message: message.to_string(),
            })
            .collect();
        chat.add(Role::User, &transcript(&second_round));
        chat.add(
            Role::Assistant,
            &serde_json::to_string(&[
                "The latest advancements in AI technology",
                "The significance of the Treaty of Versailles",
                "Why cats always land on their feet",
                "Nutritional overview of pizza",
                "Thoughts on the latest Mars rover mission",
                "Climate change and renewable energy sources",
                "'The Lost Symbol' by Dan Brown",
            ])?,
        );

        chat.add(Role::User, &transcript(messages));

        let text = self
            .backend
            .complete(CompletionRequest::chat(chat, model).seed("[\""))
            .await?;
        let end = text
            .rfind(']')
            .ok_or_else(|| anyhow!("topic list was never closed: {}", text))?;
        serde_json::from_str(&text[..=end]).context("Failed to parse topic list")
    }
}

fn action_list_seed(example: &Episode) -> String {
    let serialized = serde_json::to_string(&example.actions).unwrap_or_default();
    let marker = "\"character\":\"";
    match serialized.find(marker) {
        Some(position) => serialized[..position + marker.len()].to_string(),
        None => "[{\"character\":\"".to_string(),
    }
}

fn list_episode_dirs(dir: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn load_pool_episode(path: &Path) -> Result<Episode> {
    let content = std::fs::read_to_string(path.join("actions.json"))
        .with_context(|| format!("Failed to read example episode at {:?}", path))?;
    Episode::from_json(&content)
}

/// Classifier-ordered pool with a diversity lottery and a curated floor of 3.
fn assemble_topic_pool(
    matching: Vec<PathBuf>,
    rest: Vec<PathBuf>,
    curated: &[PathBuf],
) -> Vec<PathBuf> {
    let mut rng = rand::rng();
    let mut pool: Vec<PathBuf> = matching.into_iter().chain(rest).collect();

    // Occasionally cross-infect with an unrelated exemplar.
    if rng.random::<f64>() > 0.9 {
        if let Some(extra) = curated.choose(&mut rng) {
            pool.push(extra.clone());
        }
    }
    while pool.len() < 3 {
        match curated.choose(&mut rng) {
            Some(extra) => pool.push(extra.clone()),
            None => break,
        }
    }
    pool
}

/// Repeated draws favoring episodes with more than the minimum action count;
/// bounded so unreadable pools cannot spin forever.
fn sample_episodes(pool: &[PathBuf]) -> Result<Vec<Episode>> {
    let mut rng = rand::rng();
    let target = rng.random_range(3..=pool.len().max(3));
    let max_draws = pool.len() * 20 + 50;

    let mut selected = Vec::new();
    for _ in 0..max_draws {
        if selected.len() >= target {
            break;
        }
        let Some(path) = pool.choose(&mut rng) else { break };
        match load_pool_episode(path) {
            Ok(episode) => {
                if episode.actions.len() > MIN_EPISODE_ACTIONS || rng.random::<f64>() > 0.95 {
                    selected.push(episode);
                }
            }
            Err(e) => warn!("Skipping unreadable example episode: {}", e),
        }
    }

    if selected.is_empty() {
        return Err(anyhow!("example pool yielded no usable episodes"));
    }
    Ok(selected)
}
