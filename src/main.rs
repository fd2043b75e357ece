mod chat;
mod config;
mod episode;
mod fewshot;
mod generator;
mod ollama;
mod poll;
mod recover;
mod scraper;

use anyhow::{Context, Result};
use config::Config;
use episode::{Episode, SupportedScenes, MIN_EPISODE_ACTIONS};
use generator::EpisodeGenerator;
use log::{error, info, warn};
use ollama::OllamaClient;
use poll::Poll;
use rand::seq::IndexedRandom;
use regex::Regex;
use scraper::WebScraper;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid backend settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let client = OllamaClient::new(&config).await?;
    client.ensure_model(&config.backend.vision_model).await?;
    client.ensure_model(&config.backend.categorizer_model).await?;
    for model in &config.backend.models {
        client.ensure_model(model).await?;
    }

    validate_episode_pools(&config);

    let scenes =
        SupportedScenes::load(&config.scenes_file).context("Failed to load supported scenes")?;
    if config.episode_titles.is_empty() {
        anyhow::bail!("no episode titles configured");
    }
    if config.backend.models.is_empty() {
        anyhow::bail!("no text models configured");
    }

    let mut timings: HashMap<String, Vec<f64>> = HashMap::new();

    loop {
        let (title, model) = {
            let mut rng = rand::rng();
            (
                config.episode_titles.choose(&mut rng).unwrap().clone(),
                config.backend.models.choose(&mut rng).unwrap().clone(),
            )
        };

        println!("Generating episode '{}' with model '{}'", title, model);
        let started = Instant::now();

        let mut generator =
            EpisodeGenerator::new(&client, &config, Box::new(WebScraper::new()), &model);
        match generator.generate(&title, &scenes).await {
            Ok(episode) => {
                let elapsed = started.elapsed().as_secs_f64();
                match persist_episode(&config, &episode, &model) {
                    Ok(target) => println!("Episode ready: {}", target.display()),
                    Err(e) => {
                        error!("Failed to persist episode '{}': {:#}", title, e);
                        continue;
                    }
                }

                if elapsed > 3.0 {
                    timings.entry(model.clone()).or_default().push(elapsed);
                }
                for (name, times) in &timings {
                    let average = times.iter().sum::<f64>() / times.len() as f64;
                    info!("Average time for {} to produce an episode: {:.0} seconds", name, average);
                }

                refresh_poll(&config);
            }
            // Exhausted retry budgets end up here; skip the title and move on.
            Err(e) => error!("Episode generation failed for '{}': {:#}", title, e),
        }
    }
}

fn sanitize_filename(input: &str) -> String {
    Regex::new(r"\W+").unwrap().replace_all(input, "_").into_owned()
}

/// Writes the episode into the WIP directory, then moves it into the
/// prioritized pool under the first unused version prefix.
fn persist_episode(config: &Config, episode: &Episode, model: &str) -> Result<PathBuf> {
    let identifier = sanitize_filename(&format!("{}_{}", model, episode.episode_title));

    let wip = Path::new(&config.pools.wip_dir).join(&identifier);
    if wip.exists() {
        std::fs::remove_dir_all(&wip)?;
    }
    std::fs::create_dir_all(&wip)?;
    std::fs::write(wip.join("actions.json"), episode.to_json()?)?;

    let pools = [
        &config.pools.released_dir,
        &config.pools.prioritized_dir,
        &config.pools.unreleased_dir,
    ];
    let mut version = 0;
    while pools
        .iter()
        .any(|dir| Path::new(dir).join(format!("{}_{}", version, identifier)).exists())
    {
        version += 1;
    }

    let target =
        Path::new(&config.pools.prioritized_dir).join(format!("{}_{}", version, identifier));
    std::fs::create_dir_all(&config.pools.prioritized_dir)?;
    std::fs::rename(&wip, &target)
        .with_context(|| format!("Failed to move episode into {:?}", target))?;
    Ok(target)
}

/// Deletes pool entries that no longer parse or fell below the action floor.
fn validate_episode_pools(config: &Config) {
    let pools = [
        &config.pools.released_dir,
        &config.pools.prioritized_dir,
        &config.pools.unreleased_dir,
    ];
    for pool in pools {
        let Ok(entries) = std::fs::read_dir(pool) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let keep = std::fs::read_to_string(path.join("actions.json"))
                .ok()
                .and_then(|content| Episode::from_json(&content).ok())
                .map(|episode| episode.actions.len() >= MIN_EPISODE_ACTIONS)
                .unwrap_or(false);
            if !keep {
                warn!("DELETING FAULTY EPISODE {:?}", path);
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    error!("Failed to delete faulty episode {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Rebuilds the vote file from the released pool so the REST collaborator
/// always serves a current poll.
fn refresh_poll(config: &Config) {
    let Ok(entries) = std::fs::read_dir(&config.pools.released_dir) else {
        return;
    };
    let dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    if dirs.is_empty() {
        return;
    }
    match Poll::from_episode_dirs(&dirs) {
        Ok(poll) => {
            if let Err(e) = poll.save(Path::new(&config.poll_file)) {
                error!("Failed to write poll file: {:#}", e);
            }
        }
        Err(e) => error!("Failed to build poll: {:#}", e),
    }
}
