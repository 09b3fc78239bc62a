//! `idea_generation`: themes → ideas → ranking.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{Error, ParseError};
use crate::jobs::{Checkpoints, Job, JobType, Phase, PhaseContext, Pipeline};
use crate::pipelines::parse::{bullets, extract_json_as};
use crate::pipelines::{PromptPhase, optional_input, required_input};

const DEFAULT_COUNT: u64 = 10;
const MAX_COUNT: u64 = 30;

const THEMES_SYSTEM: &str = "You are a venture studio strategist. List the themes worth \
    exploring in the given domain as a bullet list, one theme per line.";

const IDEAS_SYSTEM: &str = "You generate startup ideas. Respond with a JSON array of objects \
    with \"title\", \"pitch\" (one or two sentences) and \"theme\". ONLY output the JSON array.";

const RANKING_SYSTEM: &str = "You rank startup ideas for a venture studio. Respond with a JSON \
    array of objects with \"title\" (exactly as given), \"score\" (0-100) and \"rationale\". \
    ONLY output the JSON array.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idea {
    pub title: String,
    pub pitch: String,
    #[serde(default)]
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub title: String,
    pub score: u32,
    #[serde(default)]
    pub rationale: String,
}

/// An idea with its rank, as stored in the projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedIdea {
    pub rank: usize,
    pub title: String,
    pub pitch: String,
    pub theme: String,
    pub score: u32,
    pub rationale: String,
}

fn count(job: &Job) -> u64 {
    job.input
        .get("count")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_COUNT)
        .clamp(1, MAX_COUNT)
}

fn validate_themes(text: &str) -> Result<(), ParseError> {
    if bullets(text).is_empty() {
        return Err(ParseError::MissingField {
            field: "themes".to_string(),
            context: "theme list".to_string(),
        });
    }
    Ok(())
}

fn parse_ideas(text: &str) -> Result<Vec<Idea>, ParseError> {
    let ideas: Vec<Idea> = extract_json_as(text, "idea list")?;
    if ideas.is_empty() {
        return Err(ParseError::MissingField {
            field: "ideas".to_string(),
            context: "idea list".to_string(),
        });
    }
    Ok(ideas)
}

fn parse_rankings(text: &str) -> Result<Vec<Ranking>, ParseError> {
    let rankings: Vec<Ranking> = extract_json_as(text, "idea ranking")?;
    if let Some(bad) = rankings.iter().find(|r| r.score > 100) {
        return Err(ParseError::OutOfRange {
            field: format!("score of '{}'", bad.title),
            value: bad.score.to_string(),
        });
    }
    Ok(rankings)
}

fn validate_ideas(text: &str) -> Result<(), ParseError> {
    parse_ideas(text).map(|_| ())
}

fn validate_rankings(text: &str) -> Result<(), ParseError> {
    parse_rankings(text).map(|_| ())
}

/// Join rankings onto ideas by title, best first. Ranked titles that match
/// no idea are dropped; unranked ideas are appended with score 0.
pub fn rank(ideas: Vec<Idea>, rankings: Vec<Ranking>) -> Vec<RankedIdea> {
    let mut by_title: HashMap<String, Idea> = ideas
        .iter()
        .map(|idea| (idea.title.trim().to_lowercase(), idea.clone()))
        .collect();

    let mut ranked: Vec<RankedIdea> = Vec::with_capacity(ideas.len());
    for ranking in rankings {
        let Some(idea) = by_title.remove(&ranking.title.trim().to_lowercase()) else {
            warn!(title = %ranking.title, "Ranking names an unknown idea, dropping");
            continue;
        };
        ranked.push(RankedIdea {
            rank: 0,
            title: idea.title,
            pitch: idea.pitch,
            theme: idea.theme,
            score: ranking.score,
            rationale: ranking.rationale,
        });
    }
    // Stable: equal scores keep the ranking's order.
    ranked.sort_by(|a, b| b.score.cmp(&a.score));

    for idea in ideas {
        if let Some(idea) = by_title.remove(&idea.title.trim().to_lowercase()) {
            ranked.push(RankedIdea {
                rank: 0,
                title: idea.title,
                pitch: idea.pitch,
                theme: idea.theme,
                score: 0,
                rationale: String::new(),
            });
        }
    }

    for (i, idea) in ranked.iter_mut().enumerate() {
        idea.rank = i + 1;
    }
    ranked
}

fn render_themes(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let domain = required_input(ctx.job, "domain")?;
    let constraints = optional_input(ctx.job, "constraints");
    Ok(format!("Domain: {domain}\n\nConstraints:\n{constraints}"))
}

fn render_ideas(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let domain = required_input(ctx.job, "domain")?;
    let themes = ctx.artifact("themes")?;
    Ok(format!(
        "Domain: {domain}\n\nThemes:\n{themes}\n\nGenerate {count} ideas across these themes.",
        count = count(ctx.job)
    ))
}

fn render_ranking(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let ideas = ctx.artifact("ideas")?;
    let constraints = optional_input(ctx.job, "constraints");
    Ok(format!(
        "Ideas (JSON):\n{ideas}\n\nConstraints:\n{constraints}\n\nRank every idea."
    ))
}

pub struct IdeaGenerationPipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl IdeaGenerationPipeline {
    pub fn new() -> Self {
        Self {
            phases: vec![
                Box::new(
                    PromptPhase::new("themes", THEMES_SYSTEM, render_themes)
                        .with_validator(validate_themes)
                        .with_documents(),
                ),
                Box::new(
                    PromptPhase::new("ideas", IDEAS_SYSTEM, render_ideas)
                        .with_validator(validate_ideas)
                        .with_max_tokens(8192),
                ),
                Box::new(
                    PromptPhase::new("ranking", RANKING_SYSTEM, render_ranking)
                        .with_validator(validate_rankings),
                ),
            ],
        }
    }
}

impl Default for IdeaGenerationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for IdeaGenerationPipeline {
    fn job_type(&self) -> JobType {
        JobType::IdeaGeneration
    }

    fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    fn validate(&self, job: &Job) -> Result<(), Error> {
        required_input(job, "domain").map(|_| ())
    }

    async fn project(&self, job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
        let themes = bullets(checkpoints.get("themes").unwrap_or_default());
        let ideas = parse_ideas(checkpoints.get("ideas").unwrap_or_default())?;
        let rankings = parse_rankings(checkpoints.get("ranking").unwrap_or_default())?;

        Ok(json!({
            "domain": required_input(job, "domain")?,
            "themes": themes,
            "ideas": rank(ideas, rankings),
        }))
    }
}
