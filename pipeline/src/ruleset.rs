use std::collections::HashMap;
use std::path::Path;

/// Free-text analyst rules handed to the classifier alongside each
/// category's records.
///
/// One file per category under the rules directory (`auth.rules`,
/// `search.rules`, `general.rules`); `#` comments and blank lines are
/// stripped, the rest is bulleted verbatim. A missing file simply means no
/// extra rules for that category.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: HashMap<String, String>,
}

impl Ruleset {
    pub fn load(dir: &Path, categories: &[&str]) -> Self {
        let mut rules = HashMap::new();
        for category in categories {
            let path = dir.join(format!("{category}.rules"));
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Some(parsed) = parse_rules(&text) {
                        tracing::info!(category, path = %path.display(), "loaded analyst rules");
                        rules.insert((*category).to_string(), parsed);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(category, path = %path.display(), error = %err, "could not read rules file");
                }
            }
        }
        Self { rules }
    }

    pub fn for_category(&self, category: &str) -> &str {
        self.rules.get(category).map(String::as_str).unwrap_or("")
    }
}

fn parse_rules(text: &str) -> Option<String> {
    let lines: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| format!("- {line}"))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
