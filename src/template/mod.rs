//! Directory template matching.
//!
//! A template is a tree of nodes, one tree level per directory level. Each
//! node carries a pattern tried against a directory name; named groups become
//! context fields. `{field}` is shorthand for a named group matching any
//! name, so `sub-{subject}` matches `sub-01` and sets `subject=01`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ItemContext, NodeContext, PackfileSpec};

static FIELD_SHORTHAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("field shorthand regex")
});

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template node has an empty pattern")]
    EmptyPattern,

    #[error("Invalid pattern '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },

    #[error("Template node '{0}' sets both scan and packfile_type")]
    Conflict(String),
}

/// Serialized form of a template node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateNodeConfig {
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packfile_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packfile_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flatten: bool,
    /// Hand the directory to this scanner instead of descending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignore: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TemplateNodeConfig>,
}

impl TemplateNodeConfig {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    pub fn with_child(mut self, child: TemplateNodeConfig) -> Self {
        self.children.push(child);
        self
    }
}

/// Parse a `level:level:...` template string into a chain of nodes.
///
/// ```
/// use bulk_import::template::parse_template_string;
/// let levels = parse_template_string("{subject}:{session}");
/// assert_eq!(levels[0].pattern, "{subject}");
/// assert_eq!(levels[0].children[0].pattern, "{session}");
/// ```
pub fn parse_template_string(template: &str) -> Vec<TemplateNodeConfig> {
    let mut chain: Option<TemplateNodeConfig> = None;
    for level in template.split(':').rev().filter(|l| !l.is_empty()) {
        let mut node = TemplateNodeConfig::pattern(level);
        if let Some(child) = chain.take() {
            node.children.push(child);
        }
        chain = Some(node);
    }
    chain.into_iter().collect()
}

/// Where matching continues for the next directory level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateCursor {
    /// The top level of the template.
    Root,
    /// The children of a matched node.
    Node(usize),
    /// Past the end of the template; nothing more to match.
    Terminal,
}

pub trait TemplateMatcher: Send + Sync {
    /// Match `dirname` at `cursor`, recording extracted fields and node
    /// directives in `context`. Returns the cursor for the directory's
    /// children.
    fn extract_metadata(
        &self,
        cursor: TemplateCursor,
        dirname: &str,
        context: &mut ItemContext,
    ) -> TemplateCursor;
}

#[derive(Debug)]
struct TemplateNode {
    pattern: Regex,
    packfile: Option<PackfileSpec>,
    scan: Option<String>,
    ignore: bool,
    children: Vec<usize>,
}

/// Compiled template tree.
#[derive(Debug, Default)]
pub struct Template {
    nodes: Vec<TemplateNode>,
    roots: Vec<usize>,
}

impl Template {
    pub fn from_config(levels: &[TemplateNodeConfig]) -> Result<Self, TemplateError> {
        let mut template = Template::default();
        let mut roots = Vec::with_capacity(levels.len());
        for level in levels {
            roots.push(template.add(level)?);
        }
        template.roots = roots;
        Ok(template)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn add(&mut self, config: &TemplateNodeConfig) -> Result<usize, TemplateError> {
        if config.scan.is_some() && config.packfile_type.is_some() {
            return Err(TemplateError::Conflict(config.pattern.clone()));
        }
        let pattern = compile_pattern(&config.pattern)?;
        let packfile = config.packfile_type.as_ref().map(|t| PackfileSpec {
            packfile_type: t.clone(),
            name: config.packfile_name.clone(),
            flatten: config.flatten,
            file_count: None,
        });

        let mut children = Vec::with_capacity(config.children.len());
        for child in &config.children {
            children.push(self.add(child)?);
        }

        self.nodes.push(TemplateNode {
            pattern,
            packfile,
            scan: config.scan.clone(),
            ignore: config.ignore,
            children,
        });
        Ok(self.nodes.len() - 1)
    }

    fn candidates(&self, cursor: TemplateCursor) -> &[usize] {
        match cursor {
            TemplateCursor::Root => &self.roots,
            TemplateCursor::Node(id) => self
                .nodes
                .get(id)
                .map(|n| n.children.as_slice())
                .unwrap_or(&[]),
            TemplateCursor::Terminal => &[],
        }
    }
}

impl TemplateMatcher for Template {
    fn extract_metadata(
        &self,
        cursor: TemplateCursor,
        dirname: &str,
        context: &mut ItemContext,
    ) -> TemplateCursor {
        for &id in self.candidates(cursor) {
            let node = &self.nodes[id];
            let Some(caps) = node.pattern.captures(dirname) else {
                continue;
            };

            for name in node.pattern.capture_names().flatten() {
                if let Some(value) = caps.name(name) {
                    context.set_field(name, value.as_str());
                }
            }
            if node.ignore {
                context.ignore = true;
            }
            if let Some(scanner_type) = &node.scan {
                context.node = NodeContext::Scanner {
                    scanner_type: scanner_type.clone(),
                };
            } else if let Some(spec) = &node.packfile {
                let mut spec = spec.clone();
                spec.name = spec.name.map(|name| expand_fields(&name, context));
                context.node = NodeContext::Packfile(spec);
            }

            return if node.children.is_empty() {
                TemplateCursor::Terminal
            } else {
                TemplateCursor::Node(id)
            };
        }
        TemplateCursor::Terminal
    }
}

/// Compile a node pattern, anchored to the whole directory name.
fn compile_pattern(pattern: &str) -> Result<Regex, TemplateError> {
    if pattern.is_empty() {
        return Err(TemplateError::EmptyPattern);
    }
    let body = if pattern.contains("(?P<") || pattern.contains("(?<") {
        pattern.to_string()
    } else {
        shorthand_to_regex(pattern)
    };
    Regex::new(&format!("^(?:{body})$")).map_err(|source| TemplateError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

/// `{field}` becomes a named group; `*` matches anything; the rest is literal.
fn shorthand_to_regex(pattern: &str) -> String {
    let literal = |s: &str| regex::escape(s).replace(r"\*", ".*");
    let mut out = String::new();
    let mut last = 0;
    for caps in FIELD_SHORTHAND.captures_iter(pattern) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&literal(&pattern[last..whole.start()]));
        out.push_str(&format!("(?P<{}>.+?)", name.as_str()));
        last = whole.end();
    }
    out.push_str(&literal(&pattern[last..]));
    out
}

/// Substitute `{field}` references with values already in the context.
fn expand_fields(template: &str, context: &ItemContext) -> String {
    FIELD_SHORTHAND
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            crate::models::ContainerType::from_str(name)
                .and_then(|level| context.metadata.get(level).map(str::to_string))
                .or_else(|| {
                    context
                        .extra
                        .get(name)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(template: &Template, dirs: &[&str]) -> (ItemContext, TemplateCursor) {
        let mut context = ItemContext::default();
        let mut cursor = TemplateCursor::Root;
        for dir in dirs {
            cursor = template.extract_metadata(cursor, dir, &mut context);
        }
        (context, cursor)
    }

    #[test]
    fn test_shorthand_levels() {
        let template = Template::from_config(&parse_template_string("sub-{subject}:{session}"))
            .unwrap();
        let (ctx, cursor) = walk(&template, &["sub-01", "baseline"]);
        assert_eq!(ctx.metadata.subject.as_deref(), Some("01"));
        assert_eq!(ctx.metadata.session.as_deref(), Some("baseline"));
        assert_eq!(cursor, TemplateCursor::Terminal);

        // A non-matching name leaves the context alone and stops matching.
        let (ctx, cursor) = walk(&template, &["other"]);
        assert!(ctx.metadata.is_empty());
        assert_eq!(cursor, TemplateCursor::Terminal);
    }

    #[test]
    fn test_regex_pattern_and_extra_fields() {
        let levels = vec![TemplateNodeConfig::pattern(
            r"(?P<subject>[A-Z]+\d+)_(?P<site>\w+)",
        )];
        let template = Template::from_config(&levels).unwrap();
        let (ctx, _) = walk(&template, &["AB12_north"]);
        assert_eq!(ctx.metadata.subject.as_deref(), Some("AB12"));
        assert_eq!(ctx.extra["site"], "north");
    }

    #[test]
    fn test_directives() {
        let mut acquisition = TemplateNodeConfig::pattern("{acquisition}");
        acquisition.packfile_type = Some("dicom".to_string());
        acquisition.packfile_name = Some("{subject}-{acquisition}.dicom.zip".to_string());
        let mut junk = TemplateNodeConfig::pattern("tmp*");
        junk.ignore = true;
        let mut scanned = TemplateNodeConfig::pattern("raw");
        scanned.scan = Some("header".to_string());

        let levels = vec![TemplateNodeConfig::pattern("{subject}")
            .with_child(junk)
            .with_child(scanned)
            .with_child(acquisition)];
        let template = Template::from_config(&levels).unwrap();

        let (ctx, _) = walk(&template, &["s1", "tmp-123"]);
        assert!(ctx.ignore);

        let (ctx, _) = walk(&template, &["s1", "raw"]);
        assert_eq!(ctx.scanner_type(), Some("header"));

        let (ctx, _) = walk(&template, &["s1", "t1"]);
        let spec = ctx.packfile().unwrap();
        assert_eq!(spec.packfile_type, "dicom");
        assert_eq!(spec.name.as_deref(), Some("s1-t1.dicom.zip"));
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Template::from_config(&[TemplateNodeConfig::pattern("")]).is_err());
        assert!(Template::from_config(&[TemplateNodeConfig::pattern("(?P<x>[")]).is_err());

        let mut both = TemplateNodeConfig::pattern("{subject}");
        both.scan = Some("header".into());
        both.packfile_type = Some("dicom".into());
        assert!(matches!(
            Template::from_config(&[both]),
            Err(TemplateError::Conflict(_))
        ));
    }
}
