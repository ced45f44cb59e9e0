//! Structured metadata: schema.org `Recipe` in HTML microdata attributes.

use std::sync::LazyLock;

use larder_core::error::AppError;
use larder_core::models::{Candidate, ExtractionMethod, RawPage, RecipeTimes};
use larder_core::traits::{Strategy, StrategyOutcome};
use scraper::{ElementRef, Html, Selector};

use super::text::{element_text, non_empty, parse_duration_minutes, split_lines};

static RECIPE_SCOPE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[itemscope][itemtype*="schema.org/Recipe"]"#).expect("valid selector")
});
static ITEMPROP: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemprop]").expect("valid selector"));
static STEP_PARTS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("li, p").expect("valid selector"));

#[derive(Debug, Clone, Copy, Default)]
pub struct MicrodataStrategy;

impl Strategy for MicrodataStrategy {
    fn name(&self) -> &'static str {
        "microdata"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Microdata
    }

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError> {
        let document = Html::parse_document(&page.html);
        let Some(scope) = document.select(&RECIPE_SCOPE).next() else {
            return Ok(StrategyOutcome::NoMatch("no Recipe itemscope".into()));
        };

        let mut candidate = Candidate::default();
        let mut times = RecipeTimes::default();

        for prop in own_props(scope) {
            let Some(names) = prop.value().attr("itemprop") else {
                continue;
            };
            for name in names.split_whitespace() {
                match name {
                    "name" => set_once(&mut candidate.title, prop_value(prop)),
                    "description" => set_once(&mut candidate.description, prop_value(prop)),
                    "image" => set_once(&mut candidate.image_url, prop_value(prop)),
                    "recipeYield" => set_once(&mut candidate.servings, prop_value(prop)),
                    "recipeCuisine" => set_once(&mut candidate.cuisine, prop_value(prop)),
                    "recipeCategory" => set_once(&mut candidate.category, prop_value(prop)),
                    "author" => set_once(&mut candidate.author, author_value(prop)),
                    "recipeIngredient" | "ingredients" => {
                        candidate.ingredients.extend(prop_value(prop));
                    }
                    "recipeInstructions" => {
                        candidate.instructions.extend(instruction_steps(prop));
                    }
                    "prepTime" => set_time(&mut times.prep_minutes, prop),
                    "cookTime" => set_time(&mut times.cook_minutes, prop),
                    "totalTime" => set_time(&mut times.total_minutes, prop),
                    _ => {}
                }
            }
        }
        candidate.times = times;

        if candidate == Candidate::default() {
            return Ok(StrategyOutcome::NoMatch("Recipe itemscope has no properties".into()));
        }
        Ok(StrategyOutcome::Candidate(candidate))
    }
}

/// Properties whose nearest enclosing itemscope is `scope` itself.
///
/// Nested items (an author `Person`, a `NutritionInformation`) carry their own
/// `name` and friends, which must not leak into the recipe.
fn own_props(scope: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    let scope_id = scope.id();
    scope.select(&ITEMPROP).filter(move |el| {
        el.ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| a.value().attr("itemscope").is_some())
            .is_some_and(|nearest| nearest.id() == scope_id)
    })
}

fn prop_value(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    let attr = match v.name() {
        "meta" => v.attr("content"),
        "img" | "source" | "video" | "audio" => v.attr("src"),
        "time" => v.attr("datetime"),
        "a" | "link" => v.attr("href"),
        _ => v.attr("content"),
    };
    match attr {
        Some(a) => non_empty(a.to_string()),
        None => non_empty(element_text(el)),
    }
}

/// A nested `Person` uses its own `name`; otherwise the property text.
fn author_value(el: ElementRef<'_>) -> Option<String> {
    if el.value().attr("itemscope").is_some() {
        let nested_name = own_props(el)
            .find(|p| p.value().attr("itemprop") == Some("name"))
            .and_then(prop_value);
        if nested_name.is_some() {
            return nested_name;
        }
    }
    prop_value(el)
}

fn instruction_steps(el: ElementRef<'_>) -> Vec<String> {
    let parts: Vec<String> = el
        .select(&STEP_PARTS)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts;
    }
    match el.value().attr("content") {
        Some(content) => split_lines(content),
        None => {
            let text: String = el.text().collect();
            split_lines(&text)
        }
    }
}

fn set_once(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn set_time(slot: &mut Option<u32>, el: ElementRef<'_>) {
    if slot.is_none() {
        *slot = prop_value(el).as_deref().and_then(parse_duration_minutes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(html: &str) -> StrategyOutcome {
        MicrodataStrategy
            .apply(&RawPage::http("https://example.com/recipe/1", html))
            .unwrap()
    }

    const PAGE: &str = r#"<html><body>
<div itemscope itemtype="https://schema.org/Recipe">
  <h1 itemprop="name">Garlic Bread</h1>
  <meta itemprop="description" content="Crisp and buttery.">
  <img itemprop="image" src="https://example.com/bread.jpg">
  <span itemprop="author" itemscope itemtype="https://schema.org/Person">
    <span itemprop="name">Jo Baker</span>
  </span>
  <time itemprop="prepTime" datetime="PT10M">10 minutes</time>
  <time itemprop="cookTime" datetime="PT15M">15 minutes</time>
  <span itemprop="recipeYield">4 servings</span>
  <ul>
    <li itemprop="recipeIngredient">1 baguette</li>
    <li itemprop="recipeIngredient">3 cloves garlic</li>
    <li itemprop="recipeIngredient">50g butter</li>
  </ul>
  <div itemprop="nutrition" itemscope itemtype="https://schema.org/NutritionInformation">
    <span itemprop="name">Nutrition facts</span>
  </div>
  <ol itemprop="recipeInstructions">
    <li>Mash garlic into butter.</li>
    <li>Spread and bake.</li>
  </ol>
</div>
</body></html>"#;

    #[test]
    fn reads_recipe_properties() {
        let StrategyOutcome::Candidate(c) = apply(PAGE) else {
            panic!("expected candidate");
        };
        assert_eq!(c.title.as_deref(), Some("Garlic Bread"));
        assert_eq!(c.description.as_deref(), Some("Crisp and buttery."));
        assert_eq!(c.image_url.as_deref(), Some("https://example.com/bread.jpg"));
        assert_eq!(c.author.as_deref(), Some("Jo Baker"));
        assert_eq!(c.servings.as_deref(), Some("4 servings"));
        assert_eq!(c.times.prep_minutes, Some(10));
        assert_eq!(c.times.cook_minutes, Some(15));
        assert_eq!(c.ingredients, vec!["1 baguette", "3 cloves garlic", "50g butter"]);
        assert_eq!(c.instructions, vec!["Mash garlic into butter.", "Spread and bake."]);
    }

    #[test]
    fn nested_item_names_do_not_leak_into_title() {
        let html = r#"<div itemscope itemtype="http://schema.org/Recipe">
  <div itemprop="author" itemscope itemtype="http://schema.org/Person"><span itemprop="name">Someone</span></div>
  <span itemprop="name">Real Title</span>
</div>"#;
        let StrategyOutcome::Candidate(c) = apply(html) else {
            panic!("expected candidate");
        };
        assert_eq!(c.title.as_deref(), Some("Real Title"));
        assert_eq!(c.author.as_deref(), Some("Someone"));
    }

    #[test]
    fn instructions_without_list_markup_split_on_lines() {
        let html = "<div itemscope itemtype=\"https://schema.org/Recipe\">\
<div itemprop=\"recipeInstructions\">Boil.\nDrain.</div></div>";
        let StrategyOutcome::Candidate(c) = apply(html) else {
            panic!("expected candidate");
        };
        assert_eq!(c.instructions, vec!["Boil.", "Drain."]);
    }

    #[test]
    fn pages_without_recipe_scope_do_not_match() {
        assert!(matches!(
            apply(r#"<div itemscope itemtype="https://schema.org/Article"><h1 itemprop="name">x</h1></div>"#),
            StrategyOutcome::NoMatch(_)
        ));
        assert!(matches!(
            apply(r#"<div itemscope itemtype="https://schema.org/Recipe"></div>"#),
            StrategyOutcome::NoMatch(_)
        ));
    }
}
