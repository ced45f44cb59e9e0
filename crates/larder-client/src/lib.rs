#[cfg(feature = "browser")]
pub mod browser_renderer;
pub mod fetcher;
pub mod identity;
pub mod strategies;

#[cfg(feature = "browser")]
pub use browser_renderer::BrowserRenderer;
pub use fetcher::ReqwestFetcher;
pub use identity::{ClientIdentity, IdentityRotation};
pub use strategies::{
    GenericStrategy, JsonLdStrategy, MicrodataStrategy, SiteRule, SiteRulesStrategy,
    default_strategies, strategies_with_rules,
};
