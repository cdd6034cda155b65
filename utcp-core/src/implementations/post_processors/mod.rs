//! Built-in tool result post-processors.

pub mod filter_dict;
pub mod limit_strings;

pub use filter_dict::FilterDictPostProcessor;
pub use limit_strings::LimitStringsPostProcessor;

use crate::data::tool::Tool;

/// Shared scoping fields: a processor applies only when the tool and its
/// owning manual pass the include/exclude lists.
pub(crate) fn in_scope(
    tool: &Tool,
    exclude_tools: &Option<Vec<String>>,
    only_include_tools: &Option<Vec<String>>,
    exclude_manuals: &Option<Vec<String>>,
    only_include_manuals: &Option<Vec<String>>,
) -> bool {
    let tool_name = tool.name.as_str();
    // The manual owning a tool is the prefix before the first dot.
    let manual_name = tool_name.split('.').next().unwrap_or(tool_name);

    if let Some(excluded) = exclude_tools {
        if excluded.iter().any(|name| name == tool_name) {
            return false;
        }
    }
    if let Some(included) = only_include_tools {
        if !included.iter().any(|name| name == tool_name) {
            return false;
        }
    }
    if let Some(excluded) = exclude_manuals {
        if excluded.iter().any(|name| name == manual_name) {
            return false;
        }
    }
    if let Some(included) = only_include_manuals {
        if !included.iter().any(|name| name == manual_name) {
            return false;
        }
    }
    true
}
