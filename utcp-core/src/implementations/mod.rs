//! Built-in implementations of the core's pluggable interfaces.

pub mod default_variable_substitutor;
pub mod in_mem_tool_repository;
pub mod post_processors;
pub mod tag_search;

pub use default_variable_substitutor::DefaultVariableSubstitutor;
pub use in_mem_tool_repository::InMemToolRepository;
pub use tag_search::TagAndDescriptionWordMatchStrategy;
