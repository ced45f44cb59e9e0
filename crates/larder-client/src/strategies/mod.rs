//! Concrete extraction strategies, in chain order.

pub mod generic;
pub mod json_ld;
pub mod microdata;
pub mod site_rules;
mod text;

use std::sync::Arc;

use larder_core::error::AppError;
use larder_core::traits::Strategy;

pub use generic::GenericStrategy;
pub use json_ld::JsonLdStrategy;
pub use microdata::MicrodataStrategy;
pub use site_rules::{SiteRule, SiteRulesStrategy};
pub use text::parse_duration_minutes;

/// JSON-LD, microdata, the given site rules, then generic heuristics.
pub fn strategies_with_rules(site_rules: SiteRulesStrategy) -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(JsonLdStrategy),
        Arc::new(MicrodataStrategy),
        Arc::new(site_rules),
        Arc::new(GenericStrategy),
    ]
}

/// The standard chain with built-in site rules.
pub fn default_strategies() -> Result<Vec<Arc<dyn Strategy>>, AppError> {
    Ok(strategies_with_rules(SiteRulesStrategy::builtin()?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use larder_core::batch::{BatchController, BatchOptions};
    use larder_core::chain::ExtractionChain;
    use larder_core::models::{ExtractionMethod, RawPage};
    use larder_core::qa::MemoryQaSink;
    use larder_core::testutil::{MockFetcher, MockRenderer, json_ld_page};
    use larder_core::throttle::{PacedFetcher, ThrottleConfig};

    use super::*;

    const JSON_LD_AND_CARD: &str = r#"<html><head>
<script type="application/ld+json">
{"@context":"https://schema.org","@type":"Recipe","name":"Shakshuka",
 "recipeIngredient":["4 eggs","1 can tomatoes","1 onion"],
 "recipeInstructions":[{"@type":"HowToStep","text":"Soften onion."},{"@type":"HowToStep","text":"Add tomatoes, then eggs."}],
 "image":"https://example.com/shakshuka.jpg","totalTime":"PT35M"}
</script></head><body>
<h1>Shakshuka</h1>
<div class="wprm-recipe-container">
  <ul><li class="wprm-recipe-ingredient">4 eggs</li><li class="wprm-recipe-ingredient">tomatoes</li></ul>
  <div class="wprm-recipe-instruction-text">Cook.</div>
</div></body></html>"#;

    #[test]
    fn default_order() {
        let chain = ExtractionChain::new(default_strategies().unwrap());
        assert_eq!(
            chain.strategy_names(),
            vec!["json_ld", "microdata", "site_rules", "generic"]
        );
    }

    #[tokio::test]
    async fn structured_data_wins_over_card_markup() {
        let chain = ExtractionChain::new(default_strategies().unwrap());
        let page = RawPage::http("https://example.com/recipes/shakshuka", JSON_LD_AND_CARD);

        let result = chain.extract(&page).await.unwrap();

        assert_eq!(result.method, ExtractionMethod::Structured);
        assert_eq!(result.fields.title, "Shakshuka");
        assert_eq!(result.fields.ingredients.len(), 3);
        assert_eq!(result.fields.times.total_minutes, Some(35));
    }

    #[tokio::test]
    async fn card_markup_is_used_without_structured_data() {
        let html = r#"<html><body><h1>Salsa</h1><div class="wprm-recipe-container">
<ul><li class="wprm-recipe-ingredient">tomatoes</li><li class="wprm-recipe-ingredient">lime</li></ul>
<div class="wprm-recipe-instruction-text">Chop and mix.</div></div></body></html>"#;
        let chain = ExtractionChain::new(default_strategies().unwrap());

        let result = chain
            .extract(&RawPage::http("https://example.com/recipes/salsa", html))
            .await
            .unwrap();

        assert_eq!(result.method, ExtractionMethod::Generic);
        assert_eq!(result.fields.title, "Salsa");
    }

    #[tokio::test]
    async fn client_rendered_page_falls_back_to_render() {
        let shell = "<html><body><div id=\"root\"></div></body></html>";
        let chain = ExtractionChain::new(default_strategies().unwrap())
            .with_renderer(MockRenderer::new(JSON_LD_AND_CARD));

        let result = chain
            .extract(&RawPage::http("https://example.com/recipes/shakshuka", shell))
            .await
            .unwrap();

        assert_eq!(result.method, ExtractionMethod::Rendered);
        assert_eq!(result.rendered_via.as_deref(), Some("json_ld"));
    }

    #[tokio::test]
    async fn shell_without_renderer_is_exhausted() {
        let chain = ExtractionChain::new(default_strategies().unwrap());
        let err = chain
            .extract(&RawPage::http("https://example.com/recipes/x", "<html></html>"))
            .await
            .unwrap_err();

        match err {
            AppError::ExtractionExhausted { attempts, .. } => assert_eq!(attempts.len(), 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_run_with_real_strategies() {
        let fetcher = MockFetcher::empty()
            .with_page("https://a.example/recipes/soup", &json_ld_page("Soup"))
            .with_page("https://b.example/recipes/stew", &json_ld_page("Stew"))
            .with_page("https://c.example/recipes/blank", "<html><body>ad</body></html>");
        let controller = BatchController::new(
            PacedFetcher::new(fetcher, ThrottleConfig::new(Duration::ZERO)),
            ExtractionChain::new(default_strategies().unwrap()),
            MemoryQaSink::new(),
        );
        let urls = vec![
            "https://a.example/recipes/soup".to_string(),
            "https://b.example/recipes/stew".to_string(),
            "https://c.example/recipes/blank".to_string(),
        ];
        let options = BatchOptions {
            inter_task_delay: Duration::ZERO,
            ..BatchOptions::default()
        };

        let stats = controller.run(&urls, &options).await;

        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_breakdown.get("extraction_exhausted"), Some(&1));
        assert_eq!(controller.qa_sink().len(), 1);
        assert!(
            stats
                .successful_results
                .iter()
                .all(|r| r.method == ExtractionMethod::Structured)
        );
    }
}
