//! `committee_build`: assemble an advisory committee for a company.
//!
//! research → roster → charter. The roster is a JSON array of members; the
//! charter is markdown with `## Mandate` and `## Decision Rules` sections.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, ParseError};
use crate::jobs::{Checkpoints, Job, JobType, Phase, PhaseContext, Pipeline};
use crate::pipelines::parse::{bullets, extract_json_as, section};
use crate::pipelines::{PromptPhase, optional_input, required_input};

const DEFAULT_SEATS: u64 = 5;
const MAX_SEATS: u64 = 12;

const RESEARCH_SYSTEM: &str = "You are a corporate governance researcher. Summarise the \
    company's stage, market, strategic questions and the expertise its board is missing. \
    Write plain prose, no more than 600 words.";

const ROSTER_SYSTEM: &str = "You design advisory committees. Respond with a JSON array of \
    members, each an object with \"name\", \"role\", \"expertise\" and \"perspective\". \
    Members are fictional personas. ONLY output the JSON array.";

const CHARTER_SYSTEM: &str = "You draft committee charters. Respond in markdown with exactly \
    two sections: \"## Mandate\" (one paragraph) and \"## Decision Rules\" (a bullet list).";

/// A committee seat as generated by the roster phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub expertise: String,
    #[serde(default)]
    pub perspective: String,
}

fn seats(job: &Job) -> u64 {
    job.input
        .get("seats")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_SEATS)
        .clamp(1, MAX_SEATS)
}

fn parse_roster(text: &str) -> Result<Vec<Member>, ParseError> {
    let members: Vec<Member> = extract_json_as(text, "committee roster")?;
    if members.is_empty() {
        return Err(ParseError::MissingField {
            field: "members".to_string(),
            context: "committee roster".to_string(),
        });
    }
    Ok(members)
}

fn validate_roster(text: &str) -> Result<(), ParseError> {
    parse_roster(text).map(|_| ())
}

fn validate_charter(text: &str) -> Result<(), ParseError> {
    section(text, "Mandate", "committee charter")?;
    section(text, "Decision Rules", "committee charter")?;
    Ok(())
}

fn render_research(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let company = required_input(ctx.job, "company")?;
    let brief = optional_input(ctx.job, "brief");
    Ok(format!("Company: {company}\n\nBrief from the founders:\n{brief}"))
}

fn render_roster(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let research = ctx.artifact("research")?;
    Ok(format!(
        "Research notes:\n{research}\n\nPropose a committee of {seats} members whose \
         expertise covers the gaps above.",
        seats = seats(ctx.job)
    ))
}

fn render_charter(ctx: &PhaseContext<'_>) -> Result<String, Error> {
    let company = required_input(ctx.job, "company")?;
    let roster = ctx.artifact("roster")?;
    Ok(format!(
        "Company: {company}\n\nCommittee members (JSON):\n{roster}\n\nDraft the charter."
    ))
}

pub struct CommitteeBuildPipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl CommitteeBuildPipeline {
    pub fn new() -> Self {
        Self {
            phases: vec![
                Box::new(PromptPhase::new("research", RESEARCH_SYSTEM, render_research).with_documents()),
                Box::new(
                    PromptPhase::new("roster", ROSTER_SYSTEM, render_roster)
                        .with_validator(validate_roster),
                ),
                Box::new(
                    PromptPhase::new("charter", CHARTER_SYSTEM, render_charter)
                        .with_validator(validate_charter)
                        .with_max_tokens(2048),
                ),
            ],
        }
    }
}

impl Default for CommitteeBuildPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for CommitteeBuildPipeline {
    fn job_type(&self) -> JobType {
        JobType::CommitteeBuild
    }

    fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    fn validate(&self, job: &Job) -> Result<(), Error> {
        required_input(job, "company").map(|_| ())
    }

    async fn project(&self, job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
        let members = parse_roster(checkpoints.get("roster").unwrap_or_default())?;
        let charter = checkpoints.get("charter").unwrap_or_default();
        let mandate = section(charter, "Mandate", "committee charter")?;
        let rules = section(charter, "Decision Rules", "committee charter")?;

        Ok(json!({
            "company": required_input(job, "company")?,
            "members": members,
            "mandate": mandate,
            "decision_rules": bullets(&rules),
        }))
    }
}
