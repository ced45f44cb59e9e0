//! Structured metadata: schema.org `Recipe` nodes in JSON-LD.

use std::sync::LazyLock;

use larder_core::error::AppError;
use larder_core::models::{Candidate, ExtractionMethod, RawPage, RecipeTimes};
use larder_core::traits::{Strategy, StrategyOutcome};
use scraper::{Html, Selector};
use serde_json::Value;

use super::text::{non_empty, parse_duration_minutes, split_lines, strip_tags};

static SCRIPT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid selector")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLdStrategy;

impl Strategy for JsonLdStrategy {
    fn name(&self) -> &'static str {
        "json_ld"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Structured
    }

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError> {
        let document = Html::parse_document(&page.html);

        let mut blocks = 0;
        let mut parse_errors = Vec::new();
        let mut nodes = Vec::new();
        for script in document.select(&SCRIPT) {
            blocks += 1;
            let raw = script.text().collect::<String>();
            match serde_json::from_str::<Value>(raw.trim()) {
                Ok(value) => nodes.extend(flatten_jsonld(value)),
                Err(e) => parse_errors.push(e.to_string()),
            }
        }

        if blocks == 0 {
            return Ok(StrategyOutcome::NoMatch("no JSON-LD blocks".into()));
        }
        if nodes.is_empty() && !parse_errors.is_empty() {
            return Err(AppError::Strategy {
                strategy: self.name().into(),
                message: format!("malformed JSON-LD: {}", parse_errors.join("; ")),
            });
        }

        match nodes.iter().find(|n| is_recipe(n)) {
            Some(node) => Ok(StrategyOutcome::Candidate(candidate_from_node(node))),
            None => Ok(StrategyOutcome::NoMatch(format!(
                "no Recipe node in {blocks} JSON-LD block(s)"
            ))),
        }
    }
}

/// Flatten arrays, `@graph` containers and `mainEntity` wrappers into nodes.
fn flatten_jsonld(value: Value) -> Vec<Value> {
    match value {
        Value::Array(arr) => arr.into_iter().flat_map(flatten_jsonld).collect(),
        Value::Object(mut obj) => {
            if let Some(graph) = obj.remove("@graph") {
                return flatten_jsonld(graph);
            }
            let mut nodes = Vec::new();
            if let Some(main) = obj.get("mainEntity").cloned()
                && main.is_object()
            {
                nodes.extend(flatten_jsonld(main));
            }
            nodes.insert(0, Value::Object(obj));
            nodes
        }
        _ => Vec::new(),
    }
}

fn is_recipe(node: &Value) -> bool {
    match node.get("@type") {
        Some(Value::String(t)) => type_is_recipe(t),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(type_is_recipe),
        _ => false,
    }
}

fn type_is_recipe(t: &str) -> bool {
    t.rsplit('/').next().is_some_and(|t| t.eq_ignore_ascii_case("Recipe"))
}

fn candidate_from_node(node: &Value) -> Candidate {
    let ingredients = node
        .get("recipeIngredient")
        .or_else(|| node.get("ingredients"))
        .map(string_list)
        .unwrap_or_default();

    let mut instructions = Vec::new();
    if let Some(value) = node.get("recipeInstructions") {
        collect_instructions(value, &mut instructions);
    }

    Candidate {
        title: node.get("name").and_then(as_text),
        description: node.get("description").and_then(as_text),
        image_url: node.get("image").and_then(image_url),
        servings: node.get("recipeYield").and_then(servings),
        times: RecipeTimes {
            prep_minutes: duration(node, "prepTime"),
            cook_minutes: duration(node, "cookTime"),
            total_minutes: duration(node, "totalTime"),
        },
        ingredients,
        instructions,
        author: node.get("author").and_then(author),
        cuisine: node.get("recipeCuisine").and_then(joined),
        category: node.get("recipeCategory").and_then(joined),
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(strip_tags(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => split_lines(&strip_tags(s)),
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        _ => Vec::new(),
    }
}

fn joined(value: &Value) -> Option<String> {
    let parts = string_list(value);
    non_empty(parts.join(", "))
}

/// Strings, `HowToStep`s, `HowToSection.itemListElement` and nested lists.
fn collect_instructions(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(split_lines(&strip_tags(s))),
        Value::Array(items) => {
            for item in items {
                collect_instructions(item, out);
            }
        }
        Value::Object(obj) => {
            if let Some(children) = obj.get("itemListElement") {
                collect_instructions(children, out);
            } else if let Some(text) = obj.get("text").and_then(as_text) {
                out.push(text);
            } else if let Some(name) = obj.get("name").and_then(as_text) {
                out.push(name);
            }
        }
        _ => {}
    }
}

fn image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s.clone()),
        Value::Array(items) => items.iter().find_map(image_url),
        Value::Object(obj) => obj
            .get("url")
            .or_else(|| obj.get("contentUrl"))
            .and_then(image_url),
        _ => None,
    }
}

fn author(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s.clone()),
        Value::Object(obj) => obj.get("name").and_then(as_text),
        Value::Array(items) => {
            let names: Vec<String> = items.iter().filter_map(author).collect();
            non_empty(names.join(", "))
        }
        _ => None,
    }
}

/// `recipeYield` as string, number or list; prefer the most descriptive entry.
fn servings(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => {
            let texts: Vec<String> = items.iter().filter_map(as_text).collect();
            texts
                .iter()
                .find(|t| t.chars().any(char::is_alphabetic))
                .or_else(|| texts.first())
                .cloned()
        }
        other => as_text(other),
    }
}

fn duration(node: &Value, key: &str) -> Option<u32> {
    node.get(key)
        .and_then(Value::as_str)
        .and_then(parse_duration_minutes)
}
