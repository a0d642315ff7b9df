//! Rule Engine: per-site rules loaded from YAML files.
//!
//! A rule file describes one site:
//!
//! ```yaml
//! name: example
//! source: 3
//! currency: 0
//! match: ['^https?://item\.example\.com/', '^https?://s\.example\.com/']
//! chain:
//!   - match: ['^https?://s\.example\.com/']
//!     index: 's\.example\.com/p/([0-9]+)'
//!     index_count: 1
//!     template: 'https://item.example.com/$1.html'
//! id:
//!   match: ['item\.example\.com/([0-9]+)\.html']
//!   index: 1
//! scripts:
//!   - name: price
//!     script: "document.querySelector('.price').innerText"
//!     sleep: 200
//! ```
//!
//! Every pattern is compiled when the file is loaded; a bad pattern or a
//! malformed file fails the whole load.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, RuleError};

/// Placeholder replaced by the product id in scripts and chain templates.
pub const ID_PLACEHOLDER: &str = "$id";

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: u32,
    #[serde(default)]
    currency: u32,
    #[serde(rename = "match", default)]
    matches: Vec<String>,
    #[serde(default)]
    chain: Vec<ChainFile>,
    id: Option<IdFile>,
    #[serde(default)]
    scripts: Vec<ScriptFile>,
}

#[derive(Debug, Deserialize)]
struct ChainFile {
    #[serde(rename = "match", default)]
    matches: Vec<String>,
    index: Option<String>,
    #[serde(default)]
    index_count: usize,
    template: Option<String>,
    script: Option<String>,
    script_template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdFile {
    #[serde(rename = "match", default)]
    matches: Vec<String>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    name: String,
    script: String,
    #[serde(rename = "async", default)]
    is_async: bool,
    /// Milliseconds.
    #[serde(default)]
    sleep: u64,
}

/// Rewrites a URL by capture and template.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub pattern: Regex,
    /// Participating capture groups required before the template is expanded.
    pub index_count: usize,
    pub template: String,
}

/// Reads a value from the page and substitutes it into a template.
#[derive(Debug, Clone)]
pub struct ChainScript {
    pub expression: String,
    pub template: String,
}

/// Turns an intermediate URL into the canonical product URL.
#[derive(Debug, Clone)]
pub struct Chain {
    pub matches: Vec<Regex>,
    pub rewrite: Option<Rewrite>,
    pub script: Option<ChainScript>,
}

impl Chain {
    pub fn is_match(&self, url: &str) -> bool {
        self.matches.iter().any(|pattern| pattern.is_match(url))
    }

    /// Expand the rewrite template from `url`.
    ///
    /// Returns `None` unless the rewrite pattern matches with exactly
    /// `index_count` participating groups.
    pub fn resolve(&self, url: &str) -> Option<String> {
        let rewrite = self.rewrite.as_ref()?;
        let captures = rewrite.pattern.captures(url)?;
        let participating = captures.iter().skip(1).flatten().count();
        if participating != rewrite.index_count {
            debug!(
                url,
                participating,
                expected = rewrite.index_count,
                "chain capture count mismatch"
            );
            return None;
        }

        let mut resolved = String::new();
        captures.expand(&rewrite.template, &mut resolved);
        (!resolved.is_empty()).then_some(resolved)
    }

    /// Fill the page-script template with the script's result.
    pub fn script_url(&self, value: &str) -> Option<String> {
        let script = self.script.as_ref()?;
        if value.is_empty() {
            return None;
        }
        Some(script.template.replace(ID_PLACEHOLDER, value))
    }
}

#[derive(Debug, Clone)]
pub struct IdPattern {
    pub matches: Vec<Regex>,
    pub index: usize,
}

/// One field extraction step.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub name: String,
    pub expression: String,
    pub is_async: bool,
    pub sleep: Duration,
}

impl Script {
    pub fn expression_for(&self, id: &str) -> String {
        self.expression.replace(ID_PLACEHOLDER, id)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub source: u32,
    pub currency: u32,
    pub matches: Vec<Regex>,
    pub chains: Vec<Chain>,
    pub id: IdPattern,
    pub scripts: Vec<Script>,
    /// File or label the rule was loaded from.
    pub origin: String,
}

impl Rule {
    pub fn parse(origin: &str, yaml: &str) -> Result<Self> {
        let file: RuleFile = serde_yaml::from_str(yaml).map_err(|source| RuleError::Yaml {
            origin: origin.to_string(),
            source,
        })?;
        Self::compile(origin, file)
    }

    fn compile(origin: &str, file: RuleFile) -> Result<Self> {
        let invalid = |reason: &str| RuleError::Invalid {
            origin: origin.to_string(),
            reason: reason.to_string(),
        };

        if file.matches.is_empty() {
            return Err(invalid("rule has no match patterns"));
        }
        let id = file.id.ok_or_else(|| invalid("rule has no id section"))?;
        if id.matches.is_empty() {
            return Err(invalid("id has no match patterns"));
        }
        let id = IdPattern {
            matches: compile_all(origin, &id.matches)?,
            index: id.index,
        };
        if let Some(pattern) = id.matches.iter().find(|p| id.index >= p.captures_len()) {
            return Err(invalid(&format!(
                "id index {} exceeds the groups of '{}'",
                id.index,
                pattern.as_str()
            )));
        }

        let mut chains = Vec::with_capacity(file.chain.len());
        for chain in file.chain {
            if chain.matches.is_empty() {
                return Err(invalid("chain has no match patterns"));
            }
            let rewrite = match (chain.index, chain.template) {
                (Some(index), Some(template)) => Some(Rewrite {
                    pattern: compile(origin, &index)?,
                    index_count: chain.index_count,
                    template,
                }),
                (None, None) => None,
                _ => return Err(invalid("chain index and template must be set together")),
            };
            let script = match (chain.script, chain.script_template) {
                (Some(expression), Some(template)) => Some(ChainScript {
                    expression,
                    template,
                }),
                (None, None) => None,
                _ => {
                    return Err(invalid(
                        "chain script and script_template must be set together",
                    ));
                }
            };
            if rewrite.is_none() && script.is_none() {
                return Err(invalid("chain declares neither a rewrite nor a script"));
            }
            chains.push(Chain {
                matches: compile_all(origin, &chain.matches)?,
                rewrite,
                script,
            });
        }

        let scripts = file
            .scripts
            .into_iter()
            .map(|script| Script {
                name: script.name,
                expression: script.script,
                is_async: script.is_async,
                sleep: Duration::from_millis(script.sleep),
            })
            .collect();

        Ok(Self {
            name: file.name,
            source: file.source,
            currency: file.currency,
            matches: compile_all(origin, &file.matches)?,
            chains,
            id,
            scripts,
            origin: origin.to_string(),
        })
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.matches.iter().any(|pattern| pattern.is_match(url))
    }

    /// First chain whose patterns match `url`.
    pub fn find_chain(&self, url: &str) -> Option<&Chain> {
        self.chains.iter().find(|chain| chain.is_match(url))
    }

    /// Product id from the first id pattern capturing at the configured index.
    pub fn extract_id(&self, url: &str) -> Option<String> {
        self.id
            .matches
            .iter()
            .filter_map(|pattern| pattern.captures(url))
            .find_map(|captures| captures.get(self.id.index))
            .map(|group| group.as_str().to_string())
            .filter(|id| !id.is_empty())
    }
}

fn compile(origin: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| RuleError::Pattern {
        origin: origin.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_all(origin: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|pattern| compile(origin, pattern)).collect()
}

/// An immutable, ordered rule index. Replace the whole set to reload.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// A set holding the single rule described by `yaml`.
    pub fn parse(origin: &str, yaml: &str) -> Result<Self> {
        Ok(Self::from_rules(vec![Rule::parse(origin, yaml)?]))
    }

    /// Load every `.yaml`/`.yml` file under `dir`, in file-name order,
    /// skipping hidden files and directories.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut rules = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_rule_file(entry.path()) {
                continue;
            }
            let path = entry.path();
            let yaml = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let rule = Rule::parse(&path.display().to_string(), &yaml)?;
            debug!(rule = %rule.name, file = %path.display(), "rule loaded");
            rules.push(rule);
        }

        info!(dir = %dir.display(), count = rules.len(), "rules loaded");
        Ok(Self { rules })
    }

    /// First rule, in load order, whose patterns match `url`.
    pub fn find_rule(&self, url: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.is_match(url))
    }

    /// The matching rule and, within it, the matching chain.
    pub fn find_chain(&self, url: &str) -> Option<(&Rule, Option<&Chain>)> {
        let rule = self.find_rule(url)?;
        Some((rule, rule.find_chain(url)))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_rule_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}
