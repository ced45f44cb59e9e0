//! Candidate validation and confidence scoring.
//!
//! A [`Candidate`] becomes [`RecipeFields`] only by passing [`validate`]:
//! non-empty title, at least [`MIN_INGREDIENTS`] ingredients and at least
//! [`MIN_INSTRUCTIONS`] instruction.

use thiserror::Error;

use crate::models::{Candidate, ExtractionMethod, RecipeFields};

pub const MIN_INGREDIENTS: usize = 2;
pub const MIN_INSTRUCTIONS: usize = 1;

const BASE_CONFIDENCE: u32 = 60;

/// Why a candidate was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("missing title")]
    MissingTitle,

    #[error("found {found} ingredient(s), need at least {required}")]
    TooFewIngredients { found: usize, required: usize },

    #[error("found {found} instruction(s), need at least {required}")]
    TooFewInstructions { found: usize, required: usize },
}

/// Normalize a candidate's text and check the record invariants.
pub fn validate(candidate: Candidate) -> Result<RecipeFields, ValidationFailure> {
    let title = candidate
        .title
        .as_deref()
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .ok_or(ValidationFailure::MissingTitle)?;

    let ingredients = clean_list(candidate.ingredients);
    if ingredients.len() < MIN_INGREDIENTS {
        return Err(ValidationFailure::TooFewIngredients {
            found: ingredients.len(),
            required: MIN_INGREDIENTS,
        });
    }

    let instructions = clean_list(candidate.instructions);
    if instructions.len() < MIN_INSTRUCTIONS {
        return Err(ValidationFailure::TooFewInstructions {
            found: instructions.len(),
            required: MIN_INSTRUCTIONS,
        });
    }

    Ok(RecipeFields {
        title,
        description: clean_optional(candidate.description),
        image_url: clean_optional(candidate.image_url),
        servings: clean_optional(candidate.servings),
        times: candidate.times,
        ingredients,
        instructions,
        author: clean_optional(candidate.author),
        cuisine: clean_optional(candidate.cuisine),
        category: clean_optional(candidate.category),
    })
}

/// The looser "is this recipe usable" rule applied by the batch controller:
/// a title, one ingredient and one instruction.
pub fn check_usable(fields: &RecipeFields) -> Result<(), ValidationFailure> {
    if fields.title.trim().is_empty() {
        return Err(ValidationFailure::MissingTitle);
    }
    let ingredients = fields.ingredients.iter().filter(|i| !i.trim().is_empty()).count();
    if ingredients == 0 {
        return Err(ValidationFailure::TooFewIngredients {
            found: 0,
            required: 1,
        });
    }
    let instructions = fields.instructions.iter().filter(|i| !i.trim().is_empty()).count();
    if instructions == 0 {
        return Err(ValidationFailure::TooFewInstructions {
            found: 0,
            required: 1,
        });
    }
    Ok(())
}

pub fn is_usable(fields: &RecipeFields) -> bool {
    check_usable(fields).is_ok()
}

/// Heuristic 0–100 quality estimate. Informational only.
pub fn confidence(method: ExtractionMethod, fields: &RecipeFields) -> u8 {
    let method_bonus = match method {
        ExtractionMethod::Structured => 20,
        ExtractionMethod::Microdata | ExtractionMethod::SiteSpecific => 15,
        ExtractionMethod::Rendered => 10,
        ExtractionMethod::Generic => 5,
        ExtractionMethod::Cache => 0,
    };

    let mut completeness = 0;
    if fields.description.is_some() {
        completeness += 3;
    }
    if fields.image_url.is_some() {
        completeness += 3;
    }
    if fields.author.is_some() {
        completeness += 2;
    }
    if !fields.times.is_empty() {
        completeness += 3;
    }
    if fields.servings.is_some() {
        completeness += 2;
    }

    (BASE_CONFIDENCE + method_bonus + completeness).min(100) as u8
}

/// Collapse whitespace and decode common HTML entities.
pub fn clean_text(raw: &str) -> String {
    let decoded = decode_entities(raw);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .iter()
        .map(|s| clean_text(s))
        .filter(|s| !s.is_empty())
        .collect()
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value.map(|v| clean_text(&v)).filter(|v| !v.is_empty())
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "frac12" => Some('½'),
        "frac14" => Some('¼'),
        "frac34" => Some('¾'),
        "deg" => Some('°'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
