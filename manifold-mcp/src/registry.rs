//! Tool registry: a lightweight metadata index over every federated tool
//!
//! The registry is immutable once built; configuration changes produce a new
//! instance. Listing supports server/tag/glob filters and opaque
//! base64-encoded cursors that survive round-trips to clients unchanged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::ToolDefinition;

/// Hard cap on page size
pub const MAX_LIST_LIMIT: usize = 5000;

/// Default pattern for public tool names
pub const DEFAULT_NAME_PATTERN: &str = "{server}_1mcp_{tool}";

/// Metadata describing one tool on one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Formats and parses the server-qualified names exposed to clients
#[derive(Debug, Clone)]
pub struct ToolNameFormatter {
    prefix: String,
    separator: String,
    suffix: String,
}

impl ToolNameFormatter {
    /// Build a formatter from a pattern containing `{server}` and `{tool}`
    pub fn new(pattern: &str) -> ProxyResult<Self> {
        let server_at = pattern.find("{server}");
        let tool_at = pattern.find("{tool}");
        match (server_at, tool_at) {
            (Some(server_at), Some(tool_at)) if server_at < tool_at => Ok(Self {
                prefix: pattern[..server_at].to_string(),
                separator: pattern[server_at + "{server}".len()..tool_at].to_string(),
                suffix: pattern[tool_at + "{tool}".len()..].to_string(),
            }),
            _ => Err(ProxyError::Configuration {
                message: format!(
                    "tool name pattern '{}' must contain {{server}} before {{tool}}",
                    pattern
                ),
            }),
        }
    }

    /// Public name for a (server, tool) pair
    pub fn format(&self, server: &str, tool: &str) -> String {
        format!(
            "{}{}{}{}{}",
            self.prefix, server, self.separator, tool, self.suffix
        )
    }

    /// Recover the (server, tool) pair from a public name. The first
    /// occurrence of the separator splits the halves, so server names must
    /// not contain it.
    pub fn parse<'a>(&self, public: &'a str) -> Option<(&'a str, &'a str)> {
        let body = public
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        let at = body.find(self.separator.as_str())?;
        let (server, rest) = body.split_at(at);
        let tool = &rest[self.separator.len()..];
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some((server, tool))
    }
}

impl Default for ToolNameFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_PATTERN).expect("default pattern is valid")
    }
}

/// Listing options
#[derive(Debug, Clone, Default)]
pub struct ToolQuery {
    pub server: Option<String>,
    pub pattern: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// One page of listing results
#[derive(Debug, Clone)]
pub struct ToolPage {
    pub tools: Vec<ToolMetadata>,
    pub total_count: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Opaque cursor payload: base64 of this JSON object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorState {
    offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

impl CursorState {
    fn encode(&self) -> String {
        BASE64.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Malformed cursors fall back to offset zero rather than failing the
    /// request.
    fn decode(raw: &str) -> Self {
        let decoded = BASE64
            .decode(raw)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        match decoded {
            Some(state) => state,
            None => {
                warn!("unparseable list cursor, restarting from offset 0");
                Self::default()
            }
        }
    }
}

/// Translate a glob where only `*` and `?` are wildcards into an anchored
/// regex; every other metacharacter matches literally.
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c if regex_syntax_char(c) => {
                translated.push('\\');
                translated.push(c);
            }
            c => translated.push(c),
        }
    }
    translated.push('$');

    match Regex::new(&translated) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern = %pattern, "invalid tool pattern: {}", e);
            None
        }
    }
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

/// Immutable index of tool metadata across upstreams
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolMetadata>,
}

impl ToolRegistry {
    /// Build from a flat metadata list; entries are sorted by (server, name)
    /// and deduplicated on that key
    pub fn from_entries(mut entries: Vec<ToolMetadata>) -> Self {
        entries.sort_by(|a, b| (a.server.as_str(), a.name.as_str()).cmp(&(b.server.as_str(), b.name.as_str())));
        entries.dedup_by(|a, b| a.server == b.server && a.name == b.name);
        Self { tools: entries }
    }

    /// Build from per-server tool listings plus that server's tag set
    pub fn from_server_tools<I>(servers: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>, Vec<ToolDefinition>)>,
    {
        let entries = servers
            .into_iter()
            .flat_map(|(server, tags, tools)| {
                tools.into_iter().map(move |tool| ToolMetadata {
                    name: tool.name,
                    server: server.clone(),
                    description: tool.description,
                    tags: tags.clone(),
                })
            })
            .collect();
        Self::from_entries(entries)
    }

    /// Number of indexed tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// List tools with filtering and cursor pagination.
    ///
    /// Filters commute; a cursor carries its filters so later pages stay
    /// consistent even if the caller drops the query options.
    pub fn list_tools(&self, query: &ToolQuery) -> ToolPage {
        let (offset, server, pattern, tag) = match &query.cursor {
            Some(raw) => {
                let state = CursorState::decode(raw);
                (state.offset, state.server, state.pattern, state.tag)
            }
            None => (
                0,
                query.server.clone(),
                query.pattern.clone(),
                query.tag.clone(),
            ),
        };

        let regex = pattern.as_deref().and_then(glob_to_regex);
        let exclude_all = pattern.is_some() && regex.is_none();

        let filtered: Vec<&ToolMetadata> = if exclude_all {
            Vec::new()
        } else {
            self.tools
                .iter()
                .filter(|tool| server.as_deref().is_none_or(|s| tool.server == s))
                .filter(|tool| {
                    regex
                        .as_ref()
                        .is_none_or(|regex| regex.is_match(&tool.name))
                })
                .filter(|tool| {
                    tag.as_deref()
                        .is_none_or(|t| tool.tags.iter().any(|have| have == t))
                })
                .collect()
        };

        let total_count = filtered.len();
        let limit = query
            .limit
            .map(|l| l.min(MAX_LIST_LIMIT))
            .unwrap_or(MAX_LIST_LIMIT);
        let offset = offset.min(total_count);
        let end = offset.saturating_add(limit).min(total_count);

        let tools: Vec<ToolMetadata> = filtered[offset..end].iter().map(|t| (*t).clone()).collect();
        let has_more = end < total_count;
        let next_cursor = has_more.then(|| {
            CursorState {
                offset: end,
                server: server.clone(),
                pattern: pattern.clone(),
                tag: tag.clone(),
            }
            .encode()
        });

        ToolPage {
            tools,
            total_count,
            has_more,
            next_cursor,
        }
    }

    /// Distinct server names, sorted
    pub fn servers(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.tools.iter().map(|t| t.server.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }

    /// Distinct tags, sorted
    pub fn tags(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .tools
            .iter()
            .flat_map(|t| t.tags.iter().map(String::as_str))
            .collect();
        set.into_iter().map(String::from).collect()
    }

    /// Tool count per server
    pub fn count_by_server(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for tool in &self.tools {
            *counts.entry(tool.server.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether a (server, tool) pair is indexed
    pub fn has_tool(&self, server: &str, name: &str) -> bool {
        self.get_tool(server, name).is_some()
    }

    /// Look up one tool by its (server, name) key
    pub fn get_tool(&self, server: &str, name: &str) -> Option<&ToolMetadata> {
        self.tools
            .binary_search_by(|t| (t.server.as_str(), t.name.as_str()).cmp(&(server, name)))
            .ok()
            .map(|at| &self.tools[at])
    }

    /// Group tools by server name
    pub fn group_by_server(&self) -> BTreeMap<String, Vec<ToolMetadata>> {
        let mut groups: BTreeMap<String, Vec<ToolMetadata>> = BTreeMap::new();
        for tool in &self.tools {
            groups
                .entry(tool.server.clone())
                .or_default()
                .push(tool.clone());
        }
        groups
    }

    /// Group tools by their first tag; untagged tools land in
    /// `uncategorized`
    pub fn categorize_by_tags(&self) -> BTreeMap<String, Vec<ToolMetadata>> {
        let mut groups: BTreeMap<String, Vec<ToolMetadata>> = BTreeMap::new();
        for tool in &self.tools {
            let category = tool
                .tags
                .first()
                .cloned()
                .unwrap_or_else(|| "uncategorized".to_string());
            groups.entry(category).or_default().push(tool.clone());
        }
        groups
    }

    /// New registry containing only tools from the given servers
    pub fn filter_by_servers(&self, servers: &HashSet<String>) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|t| servers.contains(&t.server))
                .cloned()
                .collect(),
        }
    }

    /// All entries in (server, name) order
    pub fn entries(&self) -> &[ToolMetadata] {
        &self.tools
    }
}
