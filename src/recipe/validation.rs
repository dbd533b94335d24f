use super::{judge, rules};
use crate::{
    llm::{AiService, UsageLedger},
    models::{CatalogItem, CriterionVerdict, StyleProfile, ValidationResult},
    sandbox::Executor,
};
use serde_json::Value;
use tracing::{debug, warn};

pub const STRUCTURAL_PENALTY: u32 = 15;
pub const SEMANTIC_PENALTY: u32 = 12;
const REASONING_EXCERPT_CHARS: usize = 120;

/// Two-layer gate: the recipe's rule program (or the built-in rules) and,
/// when a model is attached, the semantic judges.
pub struct ValidationEngine<'a> {
    executor: &'a Executor,
    judge: Option<(&'a dyn AiService, &'a UsageLedger)>,
}

impl<'a> ValidationEngine<'a> {
    pub fn structural(executor: &'a Executor) -> Self {
        Self {
            executor,
            judge: None,
        }
    }

    pub fn with_judge(
        executor: &'a Executor,
        ai: &'a dyn AiService,
        ledger: &'a UsageLedger,
    ) -> Self {
        Self {
            executor,
            judge: Some((ai, ledger)),
        }
    }

    pub async fn validate(
        &self,
        listing: &Value,
        program: &str,
        style: &StyleProfile,
        item: &CatalogItem,
    ) -> ValidationResult {
        let code_issues = self.structural_issues(listing, program, style, &item.id).await;
        let verdicts = match self.judge {
            Some((ai, ledger)) => Some(judge::judge_listing(ai, listing, style, item, ledger).await),
            None => None,
        };
        combine(code_issues, verdicts)
    }

    async fn structural_issues(
        &self,
        listing: &Value,
        program: &str,
        style: &StyleProfile,
        item_id: &str,
    ) -> Vec<String> {
        match self.executor.validate(program, listing, style).await {
            Ok(issues) => issues,
            Err(issue) => {
                if program.trim().is_empty() {
                    debug!(target = "listing.recipe", item_id, "builtin_rules");
                } else {
                    warn!(target = "listing.recipe", item_id, error = %issue, "validation_program_fallback");
                }
                rules::check(listing, style)
            }
        }
    }
}

/// Folds both layers into one result. The score depends only on the counts.
pub fn combine(code_issues: Vec<String>, verdicts: Option<Vec<CriterionVerdict>>) -> ValidationResult {
    let failed: Vec<&CriterionVerdict> = verdicts
        .iter()
        .flatten()
        .filter(|verdict| !verdict.passed)
        .collect();

    let penalty = STRUCTURAL_PENALTY.saturating_mul(code_issues.len() as u32)
        .saturating_add(SEMANTIC_PENALTY.saturating_mul(failed.len() as u32));
    let score = 100u32.saturating_sub(penalty);

    let mut issues = code_issues.clone();
    issues.extend(failed.iter().map(|verdict| {
        let excerpt: String = verdict.reasoning.chars().take(REASONING_EXCERPT_CHARS).collect();
        format!("[{}] {excerpt}", verdict.criterion)
    }));

    let passed = code_issues.is_empty() && failed.is_empty();
    let judged = verdicts.is_some();
    ValidationResult {
        passed,
        score,
        issues,
        code_issues: judged.then_some(code_issues),
        judge_criteria: verdicts,
    }
}
