//! `evaluation`: assess an opportunity against a fixed scorecard.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{Error, ParseError};
use crate::jobs::{Checkpoints, Job, JobType, Phase, PhaseContext, Pipeline};
use crate::pipelines::parse::{bullets, score, section};
use crate::pipelines::{PromptPhase, optional_input, required_input};

/// Scorecard criteria, each scored 0..=10.
pub const CRITERIA: [&str; 4] = ["Market", "Team", "Moat", "Traction"];
const MAX_SCORE: u32 = 10;

const MARKET_SYSTEM: &str = "You are a market analyst on an investment committee. Describe \
    the market for the opportunity: size, growth, buyers and competitors. Plain prose.";

const RISKS_SYSTEM: &str = "You are the committee's designated sceptic. List the most serious \
    risks of the opportunity as a bullet list, one risk per line, most serious first.";

const SCORECARD_SYSTEM: &str = "You chair an investment committee. Score the opportunity with \
    one line per criterion in the form \"Criterion: N\" (N from 0 to 10) for Market, Team, Moat \
    and Traction, then add a \"## Recommendation\" section with your verdict.";

fn validate_risks(text: &str) -> Result<(), ParseError> {
    if bullets(text).is_empty() {
        return Err(ParseError::MissingField {
            field: "risks".to_string(),
            context: "risk list".to_string(),
        });
    }
    Ok(())
}

fn parse_scorecard(text: &str) -> Result<(BTreeMap<String, u32>, String), ParseError> {
    let mut scores = BTreeMap::new();
    for criterion in CRITERIA {
        let value = score(text, criterion, MAX_SCORE, "scorecard")?;
        scores.insert(criterion.to_lowercase(), value);
    }
    let recommendation = section(text, "Recommendation", "scorecard")?;
    Ok((scores, recommendation))
}

fn validate_scorecard(text: &str) -> Result<(), ParseError> {
    parse_scorecard(text).map(|_| ())
}

fn render_market(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let opportunity = required_input(ctx.job, "opportunity")?;
    let context = optional_input(ctx.job, "context");
    Ok(format!("Opportunity: {opportunity}\n\nContext:\n{context}"))
}

fn render_risks(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let opportunity = required_input(ctx.job, "opportunity")?;
    let market = ctx.artifact("market")?;
    Ok(format!("Opportunity: {opportunity}\n\nMarket analysis:\n{market}"))
}

fn render_scorecard(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let opportunity = required_input(ctx.job, "opportunity")?;
    let market = ctx.artifact("market")?;
    let risks = ctx.artifact("risks")?;
    Ok(format!(
        "Opportunity: {opportunity}\n\nMarket analysis:\n{market}\n\nRisks:\n{risks}"
    ))
}

pub struct EvaluationPipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl EvaluationPipeline {
    pub fn new() -> Self {
        Self {
            phases: vec![
                Box::new(PromptPhase::new("market", MARKET_SYSTEM, render_market).with_documents()),
                Box::new(
                    PromptPhase::new("risks", RISKS_SYSTEM, render_risks)
                        .with_validator(validate_risks),
                ),
                Box::new(
                    PromptPhase::new("scorecard", SCORECARD_SYSTEM, render_scorecard)
                        .with_validator(validate_scorecard)
                        .with_max_tokens(2048),
                ),
            ],
        }
    }
}

impl Default for EvaluationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for EvaluationPipeline {
    fn job_type(&self) -> JobType {
        JobType::Evaluation
    }

    fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    fn validate(&self, job: &Job) -> Result<(), Error> {
        required_input(job, "opportunity").map(|_| ())
    }

    async fn project(&self, job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
        let (scores, recommendation) =
            parse_scorecard(checkpoints.get("scorecard").unwrap_or_default())?;
        let total: u32 = scores.values().sum();
        let risks = bullets(checkpoints.get("risks").unwrap_or_default());

        Ok(json!({
            "opportunity": required_input(job, "opportunity")?,
            "scores": scores,
            "total": total,
            "max_total": MAX_SCORE * CRITERIA.len() as u32,
            "risks": risks,
            "recommendation": recommendation,
        }))
    }
}
