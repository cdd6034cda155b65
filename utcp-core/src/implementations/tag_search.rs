//! Default search strategy: case-insensitive word matching against tool
//! tags (high weight) and descriptions (low weight).

use std::any::Any;
use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::data::tool::Tool;
use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::tool_repository::ToolRepository;
use crate::interfaces::tool_search::{ToolSearch, DEFAULT_SEARCH_STRATEGY};

static WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid word pattern"));

fn words_of(text: &str) -> HashSet<String> {
    WORDS
        .find_iter(text)
        .map(|word| word.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagAndDescriptionWordMatchStrategy {
    #[serde(default = "TagAndDescriptionWordMatchStrategy::default_description_weight")]
    pub description_weight: f64,
    #[serde(default = "TagAndDescriptionWordMatchStrategy::default_tag_weight")]
    pub tag_weight: f64,
}

impl TagAndDescriptionWordMatchStrategy {
    fn default_description_weight() -> f64 {
        1.0
    }

    fn default_tag_weight() -> f64 {
        3.0
    }
}

impl Default for TagAndDescriptionWordMatchStrategy {
    fn default() -> Self {
        Self {
            description_weight: Self::default_description_weight(),
            tag_weight: Self::default_tag_weight(),
        }
    }
}

impl TagAndDescriptionWordMatchStrategy {
    fn score(&self, tool: &Tool, query_lower: &str, query_words: &HashSet<String>) -> f64 {
        let mut score = 0.0;

        for tag in &tool.tags {
            let tag_lower = tag.to_lowercase();
            if query_lower.contains(&tag_lower) {
                score += self.tag_weight;
                continue;
            }
            if words_of(&tag_lower)
                .iter()
                .any(|word| query_words.contains(word))
            {
                score += self.tag_weight;
            }
        }

        if !tool.description.is_empty() {
            for word in words_of(&tool.description.to_lowercase()) {
                if word.len() > 2 && query_words.contains(&word) {
                    score += self.description_weight;
                }
            }
        }

        score
    }
}

#[async_trait]
impl ToolSearch for TagAndDescriptionWordMatchStrategy {
    fn strategy_type(&self) -> &str {
        DEFAULT_SEARCH_STRATEGY
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn search_tools(
        &self,
        tool_repository: &ToolRepository,
        query: &str,
        limit: i64,
        any_of_tags_required: Option<&[String]>,
    ) -> UtcpResult<Vec<Tool>> {
        if limit < 0 {
            return Err(UtcpError::InvalidArgument(
                "limit must be non-negative".into(),
            ));
        }

        let query_lower = query.to_lowercase();
        let query_words = words_of(&query_lower);

        let mut tools = tool_repository.get_tools().await?;

        if let Some(required) = any_of_tags_required {
            if !required.is_empty() {
                let required: HashSet<String> =
                    required.iter().map(|tag| tag.to_lowercase()).collect();
                tools.retain(|tool| {
                    tool.tags
                        .iter()
                        .any(|tag| required.contains(&tag.to_lowercase()))
                });
            }
        }

        let mut scored: Vec<(Tool, f64)> = tools
            .into_iter()
            .map(|tool| {
                let score = self.score(&tool, &query_lower, &query_words);
                (tool, score)
            })
            .collect();

        // Stable sort keeps repository enumeration order among ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);
        Ok(scored.into_iter().map(|(tool, _)| tool).collect())
    }
}

/// Config serializer for the default strategy (weights are configurable).
pub struct TagAndDescriptionWordMatchStrategyConfigSerializer;

impl crate::interfaces::serializer::Serializer<crate::interfaces::tool_search::ToolSearchStrategy>
    for TagAndDescriptionWordMatchStrategyConfigSerializer
{
    fn to_value(
        &self,
        obj: &crate::interfaces::tool_search::ToolSearchStrategy,
    ) -> UtcpResult<serde_json::Value> {
        let strategy: &TagAndDescriptionWordMatchStrategy =
            obj.downcast_ref().ok_or_else(|| {
                UtcpError::validation(
                    "TagAndDescriptionWordMatchStrategy",
                    "strategy does not match its registered type",
                )
            })?;
        let mut value = serde_json::to_value(strategy)
            .map_err(|err| UtcpError::validation("TagAndDescriptionWordMatchStrategy", err))?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "tool_search_strategy_type".into(),
                serde_json::Value::String(DEFAULT_SEARCH_STRATEGY.into()),
            );
        }
        Ok(value)
    }

    fn validate_value(
        &self,
        value: &serde_json::Value,
    ) -> UtcpResult<crate::interfaces::tool_search::ToolSearchStrategy> {
        let strategy: TagAndDescriptionWordMatchStrategy = serde_json::from_value(value.clone())
            .map_err(|err| UtcpError::validation("TagAndDescriptionWordMatchStrategy", err))?;
        Ok(crate::interfaces::tool_search::ToolSearchStrategy::new(
            strategy,
        ))
    }
}
