//! Heuristic selectors for pages without structured data or a site rule.

use std::sync::LazyLock;

use larder_core::error::AppError;
use larder_core::models::{Candidate, ExtractionMethod, RawPage, RecipeTimes};
use larder_core::traits::{Strategy, StrategyOutcome};
use scraper::{ElementRef, Html, Selector};

use super::text::{
    all_texts, element_text, first_text, meta_content, non_empty, parse_duration_minutes,
};

/// Selectors for one recipe-card layout.
struct CardLayout {
    name: &'static str,
    root: &'static str,
    title: &'static str,
    ingredients: &'static str,
    instructions: &'static str,
    servings: &'static str,
    prep: &'static str,
    cook: &'static str,
    total: &'static str,
}

/// Recipe-card plugins, most specific first; the last entry is the
/// class-name fallback that applies to the whole document.
const LAYOUTS: &[CardLayout] = &[
    CardLayout {
        name: "wprm",
        root: ".wprm-recipe-container, .wprm-recipe",
        title: ".wprm-recipe-name",
        ingredients: ".wprm-recipe-ingredient",
        instructions: ".wprm-recipe-instruction-text",
        servings: ".wprm-recipe-servings",
        prep: ".wprm-recipe-prep_time-container .wprm-recipe-time",
        cook: ".wprm-recipe-cook_time-container .wprm-recipe-time",
        total: ".wprm-recipe-total_time-container .wprm-recipe-time",
    },
    CardLayout {
        name: "tasty",
        root: ".tasty-recipes",
        title: ".tasty-recipes-title, h2",
        ingredients: ".tasty-recipes-ingredients li, .tasty-recipes-ingredients-body li",
        instructions: ".tasty-recipes-instructions li, .tasty-recipes-instructions-body li",
        servings: ".tasty-recipes-yield",
        prep: ".tasty-recipes-prep-time",
        cook: ".tasty-recipes-cook-time",
        total: ".tasty-recipes-total-time",
    },
    CardLayout {
        name: "mediavine",
        root: ".mv-create-card",
        title: ".mv-create-title",
        ingredients: ".mv-create-ingredients li",
        instructions: ".mv-create-instructions li",
        servings: ".mv-create-yield",
        prep: ".mv-create-time-prep .mv-create-time-format",
        cook: ".mv-create-time-active .mv-create-time-format",
        total: ".mv-create-time-total .mv-create-time-format",
    },
    CardLayout {
        name: "class_names",
        root: "body",
        title: "h1",
        ingredients: r#"[class*="ingredient"] li"#,
        instructions: r#"[class*="instruction"] li, [class*="direction"] li, [class*="method"] li"#,
        servings: r#"[class*="yield"], [class*="servings"]"#,
        prep: r#"[class*="prep-time"], [class*="prep_time"]"#,
        cook: r#"[class*="cook-time"], [class*="cook_time"]"#,
        total: r#"[class*="total-time"], [class*="total_time"]"#,
    },
];

struct CompiledLayout {
    name: &'static str,
    root: Selector,
    title: Selector,
    ingredients: Selector,
    instructions: Selector,
    servings: Selector,
    prep: Selector,
    cook: Selector,
    total: Selector,
}

fn sel(raw: &str) -> Selector {
    Selector::parse(raw).expect("valid selector")
}

static COMPILED: LazyLock<Vec<CompiledLayout>> = LazyLock::new(|| {
    LAYOUTS
        .iter()
        .map(|l| CompiledLayout {
            name: l.name,
            root: sel(l.root),
            title: sel(l.title),
            ingredients: sel(l.ingredients),
            instructions: sel(l.instructions),
            servings: sel(l.servings),
            prep: sel(l.prep),
            cook: sel(l.cook),
            total: sel(l.total),
        })
        .collect()
});

static H1: LazyLock<Selector> = LazyLock::new(|| sel("h1"));
static OG_TITLE: LazyLock<Selector> = LazyLock::new(|| sel(r#"meta[property="og:title"]"#));
static OG_IMAGE: LazyLock<Selector> = LazyLock::new(|| sel(r#"meta[property="og:image"]"#));
static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    sel(r#"meta[name="description"], meta[property="og:description"]"#)
});
static AUTHOR: LazyLock<Selector> = LazyLock::new(|| sel(r#"meta[name="author"]"#));

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericStrategy;

impl Strategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Generic
    }

    fn apply(&self, page: &RawPage) -> Result<StrategyOutcome, AppError> {
        let document = Html::parse_document(&page.html);

        for layout in COMPILED.iter() {
            let Some(root) = document.select(&layout.root).next() else {
                continue;
            };
            let ingredients = all_texts(root, &layout.ingredients);
            let instructions = all_texts(root, &layout.instructions);
            if ingredients.is_empty() && instructions.is_empty() {
                continue;
            }

            tracing::debug!(layout = layout.name, url = %page.url, "generic layout matched");
            let candidate = Candidate {
                title: first_text(root, &layout.title)
                    .or_else(|| first_text(document.root_element(), &H1))
                    .or_else(|| meta_content(&document, &OG_TITLE)),
                description: meta_content(&document, &DESCRIPTION),
                image_url: meta_content(&document, &OG_IMAGE),
                servings: first_text(root, &layout.servings),
                times: RecipeTimes {
                    prep_minutes: time_in(root, &layout.prep),
                    cook_minutes: time_in(root, &layout.cook),
                    total_minutes: time_in(root, &layout.total),
                },
                ingredients,
                instructions,
                author: meta_content(&document, &AUTHOR),
                cuisine: None,
                category: None,
            };
            return Ok(StrategyOutcome::Candidate(candidate));
        }

        Ok(StrategyOutcome::NoMatch(
            "no recipe card or ingredient list found".into(),
        ))
    }
}

fn time_in(root: ElementRef<'_>, selector: &Selector) -> Option<u32> {
    let el = root.select(selector).next()?;
    el.value()
        .attr("datetime")
        .map(String::from)
        .or_else(|| non_empty(element_text(el)))
        .as_deref()
        .and_then(parse_duration_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(html: &str) -> StrategyOutcome {
        GenericStrategy
            .apply(&RawPage::http("https://blog.example/lasagna", html))
            .unwrap()
    }

    #[test]
    fn reads_wprm_card() {
        let html = r#"<html><head>
<meta property="og:image" content="https://blog.example/lasagna.jpg">
<meta name="description" content="Weeknight lasagna.">
<meta name="author" content="Sam">
</head><body><h1>My Story About Lasagna</h1>
<div class="wprm-recipe-container"><div class="wprm-recipe">
  <h2 class="wprm-recipe-name">Lasagna</h2>
  <span class="wprm-recipe-servings">6</span>
  <div class="wprm-recipe-total_time-container"><span class="wprm-recipe-time">1 hr 15 mins</span></div>
  <ul><li class="wprm-recipe-ingredient">9 noodles</li><li class="wprm-recipe-ingredient">2 cups sauce</li></ul>
  <ul><li><div class="wprm-recipe-instruction-text">Layer.</div></li>
      <li><div class="wprm-recipe-instruction-text">Bake.</div></li></ul>
</div></div></body></html>"#;
        let StrategyOutcome::Candidate(c) = apply(html) else {
            panic!("expected candidate");
        };
        assert_eq!(c.title.as_deref(), Some("Lasagna"));
        assert_eq!(c.servings.as_deref(), Some("6"));
        assert_eq!(c.times.total_minutes, Some(75));
        assert_eq!(c.ingredients, vec!["9 noodles", "2 cups sauce"]);
        assert_eq!(c.instructions, vec!["Layer.", "Bake."]);
        assert_eq!(c.image_url.as_deref(), Some("https://blog.example/lasagna.jpg"));
        assert_eq!(c.description.as_deref(), Some("Weeknight lasagna."));
        assert_eq!(c.author.as_deref(), Some("Sam"));
    }

    #[test]
    fn reads_tasty_card() {
        let html = r#"<body><div class="tasty-recipes"><h2>Granola</h2>
<div class="tasty-recipes-ingredients"><ul><li>oats</li><li>honey</li></ul></div>
<div class="tasty-recipes-instructions"><ol><li>Toast.</li></ol></div></div></body>"#;
        let StrategyOutcome::Candidate(c) = apply(html) else {
            panic!("expected candidate");
        };
        assert_eq!(c.title.as_deref(), Some("Granola"));
        assert_eq!(c.ingredients, vec!["oats", "honey"]);
    }

    #[test]
    fn falls_back_to_class_name_heuristics() {
        let html = r#"<html><head><meta property="og:title" content="Pancakes"></head><body>
<div class="recipe-ingredients"><ul><li>flour</li><li>milk</li><li>egg</li></ul></div>
<div class="recipe-directions"><ol><li>Whisk.</li><li>Fry.</li></ol></div></body></html>"#;
        let StrategyOutcome::Candidate(c) = apply(html) else {
            panic!("expected candidate");
        };
        assert_eq!(c.title.as_deref(), Some("Pancakes"));
        assert_eq!(c.ingredients.len(), 3);
        assert_eq!(c.instructions, vec!["Whisk.", "Fry."]);
    }

    #[test]
    fn plain_article_does_not_match() {
        assert!(matches!(
            apply("<html><body><h1>News</h1><p>Nothing to cook.</p></body></html>"),
            StrategyOutcome::NoMatch(_)
        ));
    }
}
