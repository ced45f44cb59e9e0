//! Per-site CSS selector rules.
//!
//! A rule names the domains it covers and a selector per field. Built-in
//! rules cover a handful of large recipe sites; more can be loaded from a
//! JSON file without recompiling.

use std::path::Path;

use larder_core::error::AppError;
use larder_core::models::{Candidate, ExtractionMethod, RawPage, RecipeTimes, domain_of};
use larder_core::traits::{Strategy, StrategyOutcome};
use scraper::{Html, Selector};
use serde::Deserialize;

use super::text::{all_texts, element_text, first_text, non_empty, parse_duration_minutes};

/// Selector strings for one site, as written in a rules file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteRule {
    pub domains: Vec<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub servings: Option<String>,
    pub prep_time: Option<String>,
    pub cook_time: Option<String>,
    pub total_time: Option<String>,
    pub ingredients: String,
    pub instructions: String,
    pub author: Option<String>,
}

#[derive(Debug)]
struct CompiledRule {
    domains: Vec<String>,
    title: Option<Selector>,
    description: Option<Selector>,
    image: Option<Selector>,
    servings: Option<Selector>,
    prep_time: Option<Selector>,
    cook_time: Option<Selector>,
    total_time: Option<Selector>,
    ingredients: Selector,
    instructions: Selector,
    author: Option<Selector>,
}

impl CompiledRule {
    fn compile(rule: SiteRule) -> Result<Self, AppError> {
        if rule.domains.is_empty() {
            return Err(AppError::Config("site rule lists no domains".into()));
        }
        let opt = |s: &Option<String>| s.as_deref().map(parse_selector).transpose();
        Ok(Self {
            title: opt(&rule.title)?,
            description: opt(&rule.description)?,
            image: opt(&rule.image)?,
            servings: opt(&rule.servings)?,
            prep_time: opt(&rule.prep_time)?,
            cook_time: opt(&rule.cook_time)?,
            total_time: opt(&rule.total_time)?,
            ingredients: parse_selector(&rule.ingredients)?,
            instructions: parse_selector(&rule.instructions)?,
            author: opt(&rule.author)?,
            domains: rule
                .domains
                .iter()
                .map(|d| d.trim().trim_start_matches("www.").to_ascii_lowercase())
                .collect(),
        })
    }

    fn covers(&self, domain: &str) -> bool {
        self.domains
            .iter()
            .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
    }
}

fn parse_selector(raw: &str) -> Result<Selector, AppError> {
    Selector::parse(raw).map_err(|e| AppError::Config(format!("invalid selector '{raw}': {e}")))
}

#[derive(Debug)]
pub struct SiteRulesStrategy {
    rules: Vec<CompiledRule>,
}

impl SiteRulesStrategy {
    pub fn new(rules: Vec<SiteRule>) -> Result<Self, AppError> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Rules shipped with the crate.
    pub fn builtin() -> Result<Self, AppError> {
        Self::new(builtin_rules())
    }

    /// Parse rules from a JSON array.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let rules: Vec<SiteRule> = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("invalid site rules: {e}")))?;
        Self::new(rules)
    }

    /// Built-in rules plus those in `path`; file rules are consulted first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read site rules {}: {e}", path.display()))
        })?;
        let mut strategy = Self::from_json(&raw)?;
        strategy.rules.extend(Self::builtin()?.rules);
        Ok(strategy)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn covers(&self, url: &str) -> bool {
        domain_of(url).is_some_and(|d| self.rules.iter().any(|r| r.covers(&d)))
    }
}

impl Strategy for SiteRulesStrategy {
    fn name(&self) -> &'static str {
        "site_rules"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::SiteSpecific
    }

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError> {
        let Some(domain) = domain_of(&page.url) else {
            return Ok(StrategyOutcome::NoMatch("unparseable URL".into()));
        };
        let Some(rule) = self.rules.iter().find(|r| r.covers(&domain)) else {
            return Ok(StrategyOutcome::NoMatch(format!("no rule for {domain}")));
        };

        let document = Html::parse_document(&page.html);
        let root = document.root_element();
        let text = |sel: &Option<Selector>| sel.as_ref().and_then(|s| first_text(root, s));
        let time = |sel: &Option<Selector>| {
            sel.as_ref()
                .and_then(|s| root.select(s).next())
                .and_then(|el| {
                    el.value()
                        .attr("datetime")
                        .or_else(|| el.value().attr("content"))
                        .map(String::from)
                        .or_else(|| non_empty(element_text(el)))
                })
                .as_deref()
                .and_then(parse_duration_minutes)
        };
        let image = rule
            .image
            .as_ref()
            .and_then(|s| root.select(s).next())
            .and_then(|el| {
                let v = el.value();
                v.attr("content")
                    .or_else(|| v.attr("data-src"))
                    .or_else(|| v.attr("src"))
                    .map(String::from)
            })
            .and_then(non_empty);

        let candidate = Candidate {
            title: text(&rule.title),
            description: text(&rule.description),
            image_url: image,
            servings: text(&rule.servings),
            times: RecipeTimes {
                prep_minutes: time(&rule.prep_time),
                cook_minutes: time(&rule.cook_time),
                total_minutes: time(&rule.total_time),
            },
            ingredients: all_texts(root, &rule.ingredients),
            instructions: all_texts(root, &rule.instructions),
            author: text(&rule.author),
            cuisine: None,
            category: None,
        };

        if candidate.ingredients.is_empty() && candidate.instructions.is_empty() {
            return Ok(StrategyOutcome::NoMatch(format!(
                "rule for {domain} matched nothing"
            )));
        }
        Ok(StrategyOutcome::Candidate(candidate))
    }
}

fn rule(
    domains: &[&str],
    title: &str,
    ingredients: &str,
    instructions: &str,
) -> SiteRule {
    SiteRule {
        domains: domains.iter().map(|d| d.to_string()).collect(),
        title: Some(title.to_string()),
        description: Some(r#"meta[name="description"]"#.to_string()),
        image: Some(r#"meta[property="og:image"]"#.to_string()),
        servings: None,
        prep_time: None,
        cook_time: None,
        total_time: None,
        ingredients: ingredients.to_string(),
        instructions: instructions.to_string(),
        author: None,
    }
}

fn builtin_rules() -> Vec<SiteRule> {
    vec![
        SiteRule {
            servings: Some(".mm-recipes-details__item:last-child .mm-recipes-details__value".into()),
            author: Some(".mntl-attribution__item-name".into()),
            ..rule(
                &["allrecipes.com"],
                "h1",
                ".mm-recipes-structured-ingredients__list-item",
                ".mm-recipes-steps__content li p, .recipe__steps-content li p",
            )
        },
        SiteRule {
            author: Some(".mntl-attribution__item-name".into()),
            ..rule(
                &["seriouseats.com", "simplyrecipes.com"],
                "h1",
                ".structured-ingredients__list-item, .ingredient-list li",
                "#structured-project__steps_1-0 li p, .mntl-sc-block-group--LI p",
            )
        },
        SiteRule {
            servings: Some(".recipe-cook-and-prep-details__item:last-child".into()),
            ..rule(
                &["bbcgoodfood.com"],
                "h1",
                ".recipe__ingredients li",
                ".recipe__method-steps li .editor-content",
            )
        },
        rule(
            &["food.com"],
            "h1",
            ".ingredient-list li",
            ".direction-list li",
        ),
        SiteRule {
            author: Some("[class*=byline] a, [class*=Byline] a".into()),
            ..rule(
                &["cooking.nytimes.com"],
                "h1",
                "[class*=ingredient_ingredient]",
                "[class*=preparation_stepContent]",
            )
        },
    ]
}
