use regex::Regex;

/// Catch-all bucket. Every request that matches no rule lands here, which
/// keeps category assignment total.
pub const GENERAL: &str = "general";

struct CategoryRule {
    category: String,
    pattern: Regex,
}

/// Deterministic method+path → category mapping used to partition drained
/// batches before classification.
///
/// Rules are matched in order against the haystack `"<METHOD> <path>"`;
/// first match wins, unmatched requests fall into [`GENERAL`]. Two
/// identical requests always map to the same category.
pub struct CategoryMatcher {
    rules: Vec<CategoryRule>,
}

impl CategoryMatcher {
    /// The built-in taxonomy: credential flows vs. data-harvesting surfaces
    /// vs. everything else.
    pub fn with_default_rules() -> Self {
        Self::from_rules(&[
            (
                "auth",
                r"(?i)/(auth|login|logout|register|signup|signin|token|password|session)(/|\?|$)",
            ),
            (
                "search",
                r"(?i)/(search|query|products|catalog|lookup|export)(/|\?|$)",
            ),
        ])
        .expect("default category rules must compile")
    }

    pub fn from_rules(rules: &[(&str, &str)]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|(category, pattern)| {
                Ok(CategoryRule {
                    category: (*category).to_string(),
                    pattern: Regex::new(pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn categorize(&self, method: &str, path: &str) -> &str {
        let haystack = format!("{method} {path}");
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(&haystack))
            .map(|rule| rule.category.as_str())
            .unwrap_or(GENERAL)
    }

    /// All categories a record can land in, catch-all included. Drives
    /// ruleset loading.
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.rules.iter().map(|r| r.category.as_str()).collect();
        categories.push(GENERAL);
        categories.dedup();
        categories
    }
}

#[cfg(test)]
mod tests {
    use super::{CategoryMatcher, GENERAL};

    #[test]
    fn credential_paths_map_to_auth() {
        let matcher = CategoryMatcher::with_default_rules();
        for path in ["/login", "/v1/auth/token", "/api/register", "/LOGIN"] {
            assert_eq!(matcher.categorize("POST", path), "auth", "{path}");
        }
    }

    #[test]
    fn harvesting_paths_map_to_search() {
        let matcher = CategoryMatcher::with_default_rules();
        assert_eq!(matcher.categorize("POST", "/search"), "search");
        assert_eq!(matcher.categorize("GET", "/api/products?page=4"), "search");
    }

    #[test]
    fn unmatched_paths_fall_into_the_catch_all() {
        let matcher = CategoryMatcher::with_default_rules();
        assert_eq!(matcher.categorize("GET", "/v1/widgets/42"), GENERAL);
        assert_eq!(matcher.categorize("DELETE", "/"), GENERAL);
    }

    #[test]
    fn assignment_is_deterministic_and_first_match_wins() {
        let matcher = CategoryMatcher::from_rules(&[
            ("writes", r"^(POST|PUT|PATCH) "),
            ("search", r"/search"),
        ])
        .expect("rules should compile");
        // POST /search hits the method rule first, every time.
        for _ in 0..3 {
            assert_eq!(matcher.categorize("POST", "/search"), "writes");
        }
        assert_eq!(matcher.categorize("GET", "/search"), "search");
    }

    #[test]
    fn categories_include_the_catch_all() {
        let matcher = CategoryMatcher::with_default_rules();
        assert_eq!(matcher.categories(), vec!["auth", "search", GENERAL]);
    }
}
